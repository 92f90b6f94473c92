use crate::api::runtime::{CheckpointId, JobId, PipelineId, WorkerId};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that cross component boundaries. Cloneable so that a failure can be handed to
/// every observer of a job's completion.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum EngineError {
    /// Malformed job definition. Raised before any resource is touched.
    #[error("job definition error at `{vertex}`, identifier `{identifier}`: {reason}")]
    JobDefinition {
        vertex: String,
        identifier: String,
        reason: String,
    },

    #[error("resource insufficient for {pipeline_id} of {job_id}: required {required} slots, free {free}")]
    ResourceInsufficient {
        job_id: JobId,
        pipeline_id: PipelineId,
        required: usize,
        free: usize,
    },

    #[error("task `{task}` execution error: {reason}")]
    TaskExecution { task: String, reason: String },

    #[error("{checkpoint_id} of {pipeline_id} timeout after {timeout_ms}ms")]
    CheckpointTimeout {
        pipeline_id: PipelineId,
        checkpoint_id: CheckpointId,
        timeout_ms: u64,
    },

    #[error("{worker_id} lost, {slots} slots released")]
    WorkerLost { worker_id: WorkerId, slots: usize },

    #[error("wire message error: {0}")]
    Wire(String),

    #[error("{0} not found")]
    JobNotFound(JobId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0} canceled")]
    Canceled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn job_definition<V, I, R>(vertex: V, identifier: I, reason: R) -> Self
    where
        V: ToString,
        I: ToString,
        R: ToString,
    {
        EngineError::JobDefinition {
            vertex: vertex.to_string(),
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn task_execution<T: ToString>(task: T, err: &anyhow::Error) -> Self {
        EngineError::TaskExecution {
            task: task.to_string(),
            reason: format!("{:#}", err),
        }
    }

    /// Whether the restart policy should be consulted for this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::ResourceInsufficient { .. }
            | EngineError::TaskExecution { .. }
            | EngineError::CheckpointTimeout { .. }
            | EngineError::WorkerLost { .. } => true,
            _ => false,
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<EngineError>() {
            Ok(engine_error) => engine_error,
            Err(e) => EngineError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Wire(e.to_string())
    }
}
