use std::convert::TryFrom;

use crate::api::config::JobMode;
use crate::api::error::EngineError;
use crate::api::properties::{Properties, SystemProperties};
use crate::api::runtime::JobId;
use crate::dag::logical_dag::LogicalDag;

pub mod client;
pub mod cluster;
pub mod coordinator;
pub mod intermediate;
pub mod logger;
pub mod resource;
pub mod server;
pub mod wire;
pub mod worker;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq, Hash)]
pub enum JobStatus {
    Created,
    Scheduled,
    Running,
    /// a task failed; the job master decides between restart and fail
    Failing,
    Failed,
    Finished,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            JobStatus::Failed | JobStatus::Finished | JobStatus::Canceled => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "CREATED"),
            JobStatus::Scheduled => write!(f, "SCHEDULED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Failing => write!(f, "FAILING"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Finished => write!(f, "FINISHED"),
            JobStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

impl<'a> TryFrom<&'a str> for JobStatus {
    type Error = anyhow::Error;

    fn try_from(value: &'a str) -> Result<Self, Self::Error> {
        match value.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(JobStatus::Created),
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "RUNNING" => Ok(JobStatus::Running),
            "FAILING" => Ok(JobStatus::Failing),
            "FAILED" => Ok(JobStatus::Failed),
            "FINISHED" => Ok(JobStatus::Finished),
            "CANCELED" => Ok(JobStatus::Canceled),
            _ => Err(anyhow!("unrecognized job status: {}", value)),
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq, Hash)]
pub enum PipelineStatus {
    Created,
    /// waiting for a blocking upstream pipeline to finish
    Waiting,
    Scheduled,
    Running,
    Failing,
    Finished,
    Failed,
    Canceled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            PipelineStatus::Finished | PipelineStatus::Failed | PipelineStatus::Canceled => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Runtime state of a physical vertex or a deployed task.
#[atomic_enum]
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Created = 0,
    Deploying = 1,
    Running = 2,
    Finished = 3,
    Failed = 4,
    Canceled = 5,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        match self {
            ExecutionState::Finished | ExecutionState::Failed | ExecutionState::Canceled => true,
            _ => false,
        }
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        ExecutionState::Created
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Everything the job master needs to run a job. Built once by the client, never
/// mutated afterwards.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct JobImmutableInformation {
    pub job_id: JobId,
    pub job_name: String,
    pub env: Properties,
    pub logical_dag: LogicalDag,
    pub submit_timestamp: u64,
    /// restore every pipeline from the latest completed checkpoint of this job
    pub restore_from: Option<JobId>,
}

impl JobImmutableInformation {
    pub fn job_mode(&self) -> Result<JobMode, EngineError> {
        self.env
            .get_job_mode()
            .map_err(|e| EngineError::job_definition(self.job_name.as_str(), "job.mode", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        wire::encode(wire::MessageKind::JobInformation, self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        wire::decode(wire::MessageKind::JobInformation, bytes)
    }
}
