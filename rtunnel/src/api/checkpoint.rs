use crate::api::runtime::{CheckpointId, JobId, PipelineId, VertexId};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum CheckpointType {
    /// periodic or manually triggered
    Checkpoint,
    /// taken right before the job is stopped, for a later restore
    Savepoint,
}

impl std::fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointType::Checkpoint => write!(f, "checkpoint"),
            CheckpointType::Savepoint => write!(f, "savepoint"),
        }
    }
}

/// Marker injected at the head of a pipeline to cut the stream consistently.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub struct CheckpointBarrier {
    pub checkpoint_id: CheckpointId,
    pub timestamp: u64,
    pub checkpoint_type: CheckpointType,
}

/// Identity of a piece of task state. Unlike task ids it survives restarts, so a new
/// generation of tasks finds the state of the one it replaces.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum StateKey {
    Task { vertex_id: VertexId, subtask_index: u32 },
    Coordinator { vertex_id: VertexId },
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateKey::Task {
                vertex_id,
                subtask_index,
            } => write!(f, "{}#{}", vertex_id, subtask_index),
            StateKey::Coordinator { vertex_id } => write!(f, "{}#coordinator", vertex_id),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TaskStateBlob {
    pub key: StateKey,
    pub state: Vec<u8>,
}

/// The persisted unit: every task state of one pipeline at one barrier.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CompletedCheckpoint {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub checkpoint_id: CheckpointId,
    pub checkpoint_type: CheckpointType,
    pub trigger_timestamp: u64,
    pub completed_timestamp: u64,
    pub task_states: Vec<TaskStateBlob>,
}

impl CompletedCheckpoint {
    pub fn state_of(&self, key: &StateKey) -> Option<&[u8]> {
        self.task_states
            .iter()
            .find(|blob| blob.key.eq(key))
            .map(|blob| blob.state.as_slice())
    }
}
