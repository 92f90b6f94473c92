use std::collections::{BTreeMap, HashMap};

use crate::api::checkpoint::CompletedCheckpoint;
use crate::api::runtime::{CheckpointId, JobId, PipelineId};
use crate::storage::checkpoint::CheckpointStorage;

#[derive(Debug, Default)]
pub struct MemoryCheckpointStorage {
    history_cks: HashMap<(JobId, PipelineId), BTreeMap<CheckpointId, CompletedCheckpoint>>,
}

impl MemoryCheckpointStorage {
    pub fn new() -> Self {
        MemoryCheckpointStorage::default()
    }
}

impl CheckpointStorage for MemoryCheckpointStorage {
    fn save(&mut self, checkpoint: &CompletedCheckpoint) -> anyhow::Result<()> {
        self.history_cks
            .entry((checkpoint.job_id, checkpoint.pipeline_id))
            .or_insert_with(BTreeMap::new)
            .insert(checkpoint.checkpoint_id, checkpoint.clone());
        Ok(())
    }

    fn load_latest(
        &mut self,
        job_id: JobId,
        pipeline_id: PipelineId,
    ) -> anyhow::Result<Option<CompletedCheckpoint>> {
        Ok(self
            .history_cks
            .get(&(job_id, pipeline_id))
            .and_then(|cks| cks.values().next_back())
            .cloned())
    }

    fn retire(
        &mut self,
        job_id: JobId,
        pipeline_id: PipelineId,
        checkpoint_id: CheckpointId,
    ) -> anyhow::Result<usize> {
        match self.history_cks.get_mut(&(job_id, pipeline_id)) {
            Some(cks) => {
                let before = cks.len();
                cks.retain(|ck_id, _| *ck_id >= checkpoint_id);
                Ok(before - cks.len())
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::runtime::{CheckpointId, JobId, PipelineId};
    use crate::storage::checkpoint::memory_checkpoint_storage::MemoryCheckpointStorage;
    use crate::storage::checkpoint::tests::checkpoint;
    use crate::storage::checkpoint::CheckpointStorage;

    #[test]
    pub fn latest_and_retire_test() {
        let mut storage = MemoryCheckpointStorage::new();
        assert!(storage.load_latest(JobId(1), PipelineId(1)).unwrap().is_none());

        storage.save(&checkpoint(1, 1, 2)).unwrap();
        storage.save(&checkpoint(1, 1, 1)).unwrap();
        storage.save(&checkpoint(1, 2, 5)).unwrap();

        let latest = storage.load_latest(JobId(1), PipelineId(1)).unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, CheckpointId(2));

        assert_eq!(storage.retire(JobId(1), PipelineId(1), CheckpointId(2)).unwrap(), 1);
        assert_eq!(storage.retire(JobId(9), PipelineId(1), CheckpointId(2)).unwrap(), 0);
        let latest = storage.load_latest(JobId(1), PipelineId(2)).unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, CheckpointId(5));
    }
}
