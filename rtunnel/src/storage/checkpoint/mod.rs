use crate::api::checkpoint::CompletedCheckpoint;
use crate::api::cluster::CheckpointStorageType;
use crate::api::runtime::{CheckpointId, JobId, PipelineId};
use crate::storage::checkpoint::file_checkpoint_storage::FileCheckpointStorage;
use crate::storage::checkpoint::memory_checkpoint_storage::MemoryCheckpointStorage;

pub mod file_checkpoint_storage;
pub mod memory_checkpoint_storage;

/// Completed checkpoints keyed by `(job, pipeline, checkpoint)`. Only complete
/// checkpoints are ever written, so a reader never observes a partial snapshot.
pub trait CheckpointStorage {
    fn save(&mut self, checkpoint: &CompletedCheckpoint) -> anyhow::Result<()>;

    /// The completed checkpoint with the highest id.
    fn load_latest(
        &mut self,
        job_id: JobId,
        pipeline_id: PipelineId,
    ) -> anyhow::Result<Option<CompletedCheckpoint>>;

    /// Remove checkpoints of the pipeline older than `checkpoint_id`, returns how many.
    fn retire(
        &mut self,
        job_id: JobId,
        pipeline_id: PipelineId,
        checkpoint_id: CheckpointId,
    ) -> anyhow::Result<usize>;
}

#[derive(Debug)]
pub enum CheckpointStorageWrap {
    MemoryCheckpointStorage(MemoryCheckpointStorage),
    FileCheckpointStorage(FileCheckpointStorage),
}

impl CheckpointStorageWrap {
    pub fn new(storage_type: &CheckpointStorageType) -> anyhow::Result<Self> {
        let storage = match storage_type {
            CheckpointStorageType::Memory => {
                CheckpointStorageWrap::MemoryCheckpointStorage(MemoryCheckpointStorage::new())
            }
            CheckpointStorageType::LocalFile { dir } => {
                CheckpointStorageWrap::FileCheckpointStorage(FileCheckpointStorage::new(dir)?)
            }
        };
        info!("create checkpoint storage {}", storage_type);
        Ok(storage)
    }
}

impl CheckpointStorage for CheckpointStorageWrap {
    fn save(&mut self, checkpoint: &CompletedCheckpoint) -> anyhow::Result<()> {
        match self {
            CheckpointStorageWrap::MemoryCheckpointStorage(storage) => storage.save(checkpoint),
            CheckpointStorageWrap::FileCheckpointStorage(storage) => storage.save(checkpoint),
        }
    }

    fn load_latest(
        &mut self,
        job_id: JobId,
        pipeline_id: PipelineId,
    ) -> anyhow::Result<Option<CompletedCheckpoint>> {
        match self {
            CheckpointStorageWrap::MemoryCheckpointStorage(storage) => {
                storage.load_latest(job_id, pipeline_id)
            }
            CheckpointStorageWrap::FileCheckpointStorage(storage) => {
                storage.load_latest(job_id, pipeline_id)
            }
        }
    }

    fn retire(
        &mut self,
        job_id: JobId,
        pipeline_id: PipelineId,
        checkpoint_id: CheckpointId,
    ) -> anyhow::Result<usize> {
        match self {
            CheckpointStorageWrap::MemoryCheckpointStorage(storage) => {
                storage.retire(job_id, pipeline_id, checkpoint_id)
            }
            CheckpointStorageWrap::FileCheckpointStorage(storage) => {
                storage.retire(job_id, pipeline_id, checkpoint_id)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::api::checkpoint::{CheckpointType, CompletedCheckpoint, StateKey, TaskStateBlob};
    use crate::api::runtime::{CheckpointId, JobId, PipelineId, VertexId};

    pub(crate) fn checkpoint(job_id: u64, pipeline_id: u32, checkpoint_id: u64) -> CompletedCheckpoint {
        CompletedCheckpoint {
            job_id: JobId(job_id),
            pipeline_id: PipelineId(pipeline_id),
            checkpoint_id: CheckpointId(checkpoint_id),
            checkpoint_type: CheckpointType::Checkpoint,
            trigger_timestamp: 1,
            completed_timestamp: 2,
            task_states: vec![TaskStateBlob {
                key: StateKey::Task {
                    vertex_id: VertexId(1),
                    subtask_index: 0,
                },
                state: checkpoint_id.to_le_bytes().to_vec(),
            }],
        }
    }
}
