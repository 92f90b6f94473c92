//! Versioned schema of the messages crossing the worker boundary. Every message is a
//! JSON envelope `{version, kind, body}`; a peer refuses envelopes of another version.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::action::Action;
use crate::api::checkpoint::{CheckpointBarrier, StateKey};
use crate::api::config::Partitioner;
use crate::api::error::EngineError;
use crate::api::runtime::{
    CheckpointId, JobId, PipelineId, SlotId, TaskGroupId, TaskGroupLocation, TaskId,
    TaskLocation, VertexId,
};
use crate::api::split::SourceSplit;
use crate::runtime::intermediate::DatasetId;
use crate::runtime::ExecutionState;

pub const WIRE_VERSION: u16 = 1;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum MessageKind {
    JobInformation,
    TaskGroupDeployment,
    Operation,
    TaskEvent,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u16,
    kind: MessageKind,
    body: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    version: u16,
    kind: MessageKind,
}

#[derive(Deserialize)]
struct Envelope<T> {
    body: T,
}

pub fn encode<T: Serialize>(kind: MessageKind, body: &T) -> Result<Vec<u8>, EngineError> {
    let envelope = EnvelopeRef {
        version: WIRE_VERSION,
        kind,
        body,
    };
    serde_json::to_vec(&envelope).map_err(|e| EngineError::Wire(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(kind: MessageKind, bytes: &[u8]) -> Result<T, EngineError> {
    let header: EnvelopeHeader =
        serde_json::from_slice(bytes).map_err(|e| EngineError::Wire(e.to_string()))?;
    if header.version != WIRE_VERSION {
        return Err(EngineError::Wire(format!(
            "unsupported wire version {}, expect {}",
            header.version, WIRE_VERSION
        )));
    }
    if header.kind != kind {
        return Err(EngineError::Wire(format!(
            "unexpected message kind {:?}, expect {:?}",
            header.kind, kind
        )));
    }

    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).map_err(|e| EngineError::Wire(e.to_string()))?;
    Ok(envelope.body)
}

/// What a deployed task does inside its group.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum TaskRole {
    /// `coordinated` readers receive splits and barriers from their enumerator
    SourceReader { coordinated: bool },
    SplitEnumerator { readers: Vec<TaskLocation> },
    Transform,
    Sink,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct IntermediateInput {
    pub dataset: DatasetId,
    pub partition: u32,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct IntermediateOutput {
    pub dataset: DatasetId,
    pub partitions: u32,
    pub partitioner: Partitioner,
    /// consumers start only after this producer finished
    pub blocking: bool,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TaskDeployment {
    pub task_id: TaskId,
    pub vertex_id: VertexId,
    pub subtask_index: u32,
    pub parallelism: u32,
    pub state_key: StateKey,
    pub action: Action,
    pub role: TaskRole,
    pub restored_state: Option<Vec<u8>>,
    pub intermediate_inputs: Vec<IntermediateInput>,
    pub intermediate_outputs: Vec<IntermediateOutput>,
}

/// In-group data path between two tasks.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub struct LocalEdge {
    pub from: TaskId,
    pub to: TaskId,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TaskGroupDeployment {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub task_group_id: TaskGroupId,
    pub slot_id: SlotId,
    pub tasks: Vec<TaskDeployment>,
    pub local_edges: Vec<LocalEdge>,
    /// checkpoint the task states were restored from; checkpoint ids continue after it
    #[serde(default)]
    pub restored_checkpoint_id: CheckpointId,
}

impl TaskGroupDeployment {
    pub fn location(&self) -> TaskGroupLocation {
        TaskGroupLocation {
            job_id: self.job_id,
            pipeline_id: self.pipeline_id,
            task_group_id: self.task_group_id,
        }
    }

    pub fn task_location(&self, task_id: TaskId) -> TaskLocation {
        TaskLocation::new(self.slot_id, self.task_group_id, task_id)
    }
}

/// Operations delivered to a running task, strictly in send order.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum ControlOp {
    AssignSplit(Vec<SourceSplit>),
    NoMoreSplits,
    CheckpointBarrier(CheckpointBarrier),
    NotifyCheckpointComplete(CheckpointId),
    Cancel,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct OperationMessage {
    pub location: TaskLocation,
    pub op: ControlOp,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TaskAcknowledge {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub checkpoint_id: CheckpointId,
    pub task: TaskLocation,
    pub state_key: StateKey,
    pub state: Vec<u8>,
}

/// Worker to job master reports.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum TaskEvent {
    StateChanged {
        job_id: JobId,
        pipeline_id: PipelineId,
        task: TaskLocation,
        state: ExecutionState,
        error: Option<String>,
        /// snapshot taken on a clean finish, it stands in for later checkpoints
        final_state: Option<(StateKey, Vec<u8>)>,
    },
    CheckpointAck(TaskAcknowledge),
    CheckpointDecline {
        job_id: JobId,
        pipeline_id: PipelineId,
        checkpoint_id: CheckpointId,
        task: TaskLocation,
        reason: String,
    },
}

impl TaskEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            TaskEvent::StateChanged { job_id, .. } => *job_id,
            TaskEvent::CheckpointAck(ack) => ack.job_id,
            TaskEvent::CheckpointDecline { job_id, .. } => *job_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        encode(MessageKind::TaskEvent, self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        decode(MessageKind::TaskEvent, bytes)
    }
}
