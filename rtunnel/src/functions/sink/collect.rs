use std::collections::HashSet;

use dashmap::DashMap;

use crate::api::connector::{SinkConnector, SinkWriter, SubtaskContext};
use crate::api::element::Row;
use crate::api::properties::Properties;
use crate::api::runtime::CheckpointId;

/// collection the rows are committed to
pub const NAME: &str = "name";

#[derive(Default)]
struct Collection {
    rows: Vec<Row>,
    commits: HashSet<String>,
}

lazy_static! {
    static ref COLLECTIONS: DashMap<String, Collection> = DashMap::new();
}

/// Committed rows of a collection, in commit order.
pub fn collected(name: &str) -> Vec<Row> {
    COLLECTIONS
        .get(name)
        .map(|c| c.rows.clone())
        .unwrap_or_default()
}

pub fn clear_collection(name: &str) {
    COLLECTIONS.remove(name);
}

/// Returns false when the commit was already applied.
fn commit(name: &str, commit_key: String, rows: Vec<Row>) -> bool {
    let mut collection = COLLECTIONS.entry(name.to_string()).or_default();
    if collection.commits.insert(commit_key) {
        collection.rows.extend(rows);
        true
    } else {
        false
    }
}

/// Two-phase sink into a process wide collection. Rows become visible when the
/// checkpoint they were prepared for completes.
#[derive(Clone, Debug)]
pub struct CollectSink {
    name: String,
}

impl Default for CollectSink {
    fn default() -> Self {
        CollectSink {
            name: "default".to_string(),
        }
    }
}

impl SinkConnector for CollectSink {
    fn prepare(&mut self, config: &Properties) -> anyhow::Result<()> {
        self.name = config.get_str_or(NAME, "default").to_string();
        Ok(())
    }

    fn create_writer(&self, context: &SubtaskContext) -> anyhow::Result<Box<dyn SinkWriter>> {
        Ok(Box::new(CollectWriter {
            name: self.name.clone(),
            writer_key: format!("{}#{}", context.vertex_id, context.subtask_index),
            buffer: Vec::new(),
            prepared: None,
            uncommitted: Vec::new(),
        }))
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct CollectState {
    uncommitted: Vec<(CheckpointId, Vec<Row>)>,
}

pub struct CollectWriter {
    name: String,
    writer_key: String,
    buffer: Vec<Row>,
    prepared: Option<Vec<Row>>,
    /// prepared rows snapshotted with a checkpoint that has not been notified yet
    uncommitted: Vec<(CheckpointId, Vec<Row>)>,
}

impl CollectWriter {
    fn commit_key(&self, checkpoint_id: CheckpointId) -> String {
        format!("{}@{}", self.writer_key, checkpoint_id.0)
    }
}

impl SinkWriter for CollectWriter {
    fn open(&mut self, restored: Option<&[u8]>) -> anyhow::Result<()> {
        if let Some(bytes) = restored {
            // the state comes from a completed checkpoint, so everything in it commits
            let state: CollectState = serde_json::from_slice(bytes)?;
            for (checkpoint_id, rows) in state.uncommitted {
                let applied = commit(self.name.as_str(), self.commit_key(checkpoint_id), rows);
                debug!(
                    "{} re-commit {}: {}",
                    self.writer_key, checkpoint_id, applied
                );
            }
        }
        Ok(())
    }

    fn write(&mut self, row: Row) -> anyhow::Result<()> {
        self.buffer.push(row);
        Ok(())
    }

    fn prepare_commit(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        if self.buffer.is_empty() {
            self.prepared = None;
            return Ok(None);
        }
        let rows = std::mem::take(&mut self.buffer);
        let info = serde_json::to_vec(&rows)?;
        self.prepared = Some(rows);
        Ok(Some(info))
    }

    fn snapshot_state(&mut self, checkpoint_id: CheckpointId) -> anyhow::Result<Vec<u8>> {
        if let Some(rows) = self.prepared.take() {
            self.uncommitted.push((checkpoint_id, rows));
        }
        let state = CollectState {
            uncommitted: self.uncommitted.clone(),
        };
        Ok(serde_json::to_vec(&state)?)
    }

    fn notify_checkpoint_complete(
        &mut self,
        checkpoint_id: CheckpointId,
        commit_info: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        if let Some(info) = commit_info {
            let rows: Vec<Row> = serde_json::from_slice(info)?;
            commit(self.name.as_str(), self.commit_key(checkpoint_id), rows);
        }
        self.uncommitted.retain(|(id, _)| *id > checkpoint_id);
        self.prepared = None;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if !self.buffer.is_empty() {
            warn!(
                "{} closed with {} uncommitted rows",
                self.writer_key,
                self.buffer.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::api::connector::{SinkConnector, SubtaskContext};
    use crate::api::properties::Properties;
    use crate::api::runtime::{CheckpointId, JobId, VertexId};
    use crate::functions::sink::collect::{clear_collection, collected, CollectSink, NAME};
    use crate::functions::source::vec_source::vec_row;

    fn sink(name: &str) -> CollectSink {
        let mut properties = Properties::new();
        properties.set_str(NAME, name);
        let mut sink = CollectSink::default();
        sink.prepare(&properties).unwrap();
        sink
    }

    fn context() -> SubtaskContext {
        SubtaskContext {
            job_id: JobId(1),
            vertex_id: VertexId(4),
            subtask_index: 0,
            parallelism: 1,
        }
    }

    #[test]
    pub fn commit_on_notify_test() {
        let name = "commit_on_notify_test";
        let mut writer = sink(name).create_writer(&context()).unwrap();
        writer.open(None).unwrap();
        writer.write(vec_row(0)).unwrap();
        writer.write(vec_row(1)).unwrap();

        let info = writer.prepare_commit().unwrap();
        writer.snapshot_state(CheckpointId(1)).unwrap();
        assert!(collected(name).is_empty());

        writer
            .notify_checkpoint_complete(CheckpointId(1), info.as_deref())
            .unwrap();
        assert_eq!(collected(name), vec![vec_row(0), vec_row(1)]);

        // a repeated notification is a no-op
        writer
            .notify_checkpoint_complete(CheckpointId(1), info.as_deref())
            .unwrap();
        assert_eq!(collected(name).len(), 2);
        clear_collection(name);
    }

    #[test]
    pub fn restore_commits_once_test() {
        let name = "restore_commits_once_test";
        let sink = sink(name);
        let mut writer = sink.create_writer(&context()).unwrap();
        writer.open(None).unwrap();
        writer.write(vec_row(5)).unwrap();
        writer.prepare_commit().unwrap();
        let state = writer.snapshot_state(CheckpointId(2)).unwrap();

        // the notification got lost with the failed task
        let mut restored = sink.create_writer(&context()).unwrap();
        restored.open(Some(state.as_slice())).unwrap();
        assert_eq!(collected(name), vec![vec_row(5)]);

        let mut again = sink.create_writer(&context()).unwrap();
        again.open(Some(state.as_slice())).unwrap();
        assert_eq!(collected(name), vec![vec_row(5)]);
        clear_collection(name);
    }
}
