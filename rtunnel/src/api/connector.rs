//! Contracts the engine schedules connectors against. Implementations live outside the
//! engine; the `functions` module carries a few in-memory ones.

use crate::api::element::Row;
use crate::api::properties::Properties;
use crate::api::runtime::{CheckpointId, JobId, VertexId};
use crate::api::split::SourceSplit;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum Boundedness {
    Bounded,
    Unbounded,
}

/// Outcome of one reader poll; drives the task's backoff policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollStatus {
    MoreAvailable,
    NothingAvailable,
    End,
}

pub trait Collector {
    fn collect(&mut self, row: Row) -> anyhow::Result<()>;
}

impl Collector for Vec<Row> {
    fn collect(&mut self, row: Row) -> anyhow::Result<()> {
        self.push(row);
        Ok(())
    }
}

/// Identity of the parallel instance a connector object is created for.
#[derive(Clone, Debug, PartialEq)]
pub struct SubtaskContext {
    pub job_id: JobId,
    pub vertex_id: VertexId,
    pub subtask_index: u32,
    pub parallelism: u32,
}

pub trait SourceConnector: Send + Sync {
    fn prepare(&mut self, config: &Properties) -> anyhow::Result<()>;

    fn boundedness(&self) -> Boundedness;

    fn create_reader(&self, context: &SubtaskContext) -> anyhow::Result<Box<dyn SourceReader>>;

    /// `context.subtask_index` is the reader the enumerator works for when the source
    /// runs in parallel mode, and 0 for the global enumerator.
    fn create_split_enumerator(
        &self,
        context: &SubtaskContext,
    ) -> anyhow::Result<Box<dyn SplitEnumerator>>;
}

pub trait SourceReader: Send {
    /// `restored` is the blob returned by `snapshot_state` of the checkpoint being restored.
    fn open(&mut self, restored: Option<&[u8]>) -> anyhow::Result<()>;

    fn add_splits(&mut self, splits: Vec<SourceSplit>);

    fn handle_no_more_splits(&mut self);

    fn poll_next(&mut self, output: &mut dyn Collector) -> anyhow::Result<PollStatus>;

    fn snapshot_state(&mut self, checkpoint_id: CheckpointId) -> anyhow::Result<Vec<u8>>;

    fn notify_checkpoint_complete(&mut self, _checkpoint_id: CheckpointId) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()>;
}

pub trait SplitAssignContext {
    fn parallelism(&self) -> u32;

    fn assign_splits(&mut self, subtask_index: u32, splits: Vec<SourceSplit>) -> anyhow::Result<()>;

    fn signal_no_more_splits(&mut self, subtask_index: u32) -> anyhow::Result<()>;
}

pub trait SplitEnumerator: Send {
    fn open(&mut self, restored: Option<&[u8]>) -> anyhow::Result<()>;

    /// Invoked once every reader of the source is deployed.
    fn run(&mut self, context: &mut dyn SplitAssignContext) -> anyhow::Result<()>;

    fn snapshot_state(&mut self, checkpoint_id: CheckpointId) -> anyhow::Result<Vec<u8>>;

    fn close(&mut self) -> anyhow::Result<()>;
}

pub trait Transform: Send {
    fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// `None` drops the row.
    fn map(&mut self, row: Row) -> anyhow::Result<Option<Row>>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait SinkConnector: Send + Sync {
    fn prepare(&mut self, config: &Properties) -> anyhow::Result<()>;

    fn create_writer(&self, context: &SubtaskContext) -> anyhow::Result<Box<dyn SinkWriter>>;
}

pub trait SinkWriter: Send {
    fn open(&mut self, restored: Option<&[u8]>) -> anyhow::Result<()>;

    fn write(&mut self, row: Row) -> anyhow::Result<()>;

    /// Flush pending output at a barrier. The returned commit info is kept with the
    /// checkpoint and handed back through `notify_checkpoint_complete`.
    fn prepare_commit(&mut self) -> anyhow::Result<Option<Vec<u8>>>;

    fn snapshot_state(&mut self, checkpoint_id: CheckpointId) -> anyhow::Result<Vec<u8>>;

    fn notify_checkpoint_complete(
        &mut self,
        _checkpoint_id: CheckpointId,
        _commit_info: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()>;
}
