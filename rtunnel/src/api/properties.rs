use std::collections::HashMap;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;

use crate::api::config::JobMode;
use crate::runtime::coordinator::restart::RestartStrategy;

pub const JOB_MODE: &str = "job.mode";
pub const PARALLELISM: &str = "parallelism";
pub const CHECKPOINT_INTERVAL: &str = "checkpoint.interval";
pub const CHECKPOINT_TIMEOUT: &str = "checkpoint.timeout";
pub const RESTART_STRATEGY: &str = "restart.strategy";
pub const TASK_POLL_IDLE: &str = "task.poll.idle";

pub const DEFAULT_STREAMING_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(60);

/// Engine level keys read from a job's `env` section.
pub trait SystemProperties {
    fn set_job_mode(&mut self, job_mode: JobMode);
    fn get_job_mode(&self) -> Result<JobMode, PropertiesError>;

    fn set_parallelism(&mut self, parallelism: u32);
    fn get_parallelism(&self) -> Result<u32, PropertiesError>;

    /// Zero disables periodic checkpoints.
    fn set_checkpoint_interval(&mut self, interval: Duration);
    fn get_checkpoint_interval(&self) -> Result<Duration, PropertiesError>;

    fn set_checkpoint_timeout(&mut self, timeout: Duration);
    fn get_checkpoint_timeout(&self) -> Result<Duration, PropertiesError>;

    fn set_restart_strategy(&mut self, strategy: RestartStrategy);
    fn get_restart_strategy(&self) -> Result<RestartStrategy, PropertiesError>;

    fn set_task_poll_idle(&mut self, idle: Duration);
    fn get_task_poll_idle(&self) -> Result<Duration, PropertiesError>;
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(transparent)]
pub struct Properties {
    properties: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Properties {
            properties: HashMap::new(),
        }
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    pub fn set_string(&mut self, key: String, value: String) {
        self.properties.insert(key, value);
    }

    pub fn get_string(&self, key: &str) -> Result<String, PropertiesError> {
        match self.properties.get(key) {
            Some(v) => Ok(v.clone()),
            None => Err(PropertiesError::None(key.to_string())),
        }
    }

    pub fn get_str_or<'a>(&'a self, key: &str, default_value: &'a str) -> &'a str {
        self.properties
            .get(key)
            .map(|x| x.as_str())
            .unwrap_or(default_value)
    }

    pub fn set_u32(&mut self, key: &str, value: u32) {
        self.set_string(key.to_string(), value.to_string());
    }

    pub fn get_u32(&self, key: &str) -> Result<u32, PropertiesError> {
        match self.properties.get(key) {
            Some(v) => u32::from_str(v.trim()).map_err(|e| PropertiesError::from(e)),
            None => Err(PropertiesError::None(key.to_string())),
        }
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set_string(key.to_string(), value.to_string());
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, PropertiesError> {
        match self.properties.get(key) {
            Some(v) => u64::from_str(v.trim()).map_err(|e| PropertiesError::from(e)),
            None => Err(PropertiesError::None(key.to_string())),
        }
    }

    pub fn get_duration_millis(&self, key: &str) -> Result<Duration, PropertiesError> {
        self.get_u64(key).map(|v| Duration::from_millis(v))
    }

    pub fn set_duration_millis(&mut self, key: &str, value: Duration) {
        self.set_u64(key, value.as_millis() as u64);
    }
}

impl SystemProperties for Properties {
    fn set_job_mode(&mut self, job_mode: JobMode) {
        self.set_string(JOB_MODE.to_string(), job_mode.to_string());
    }

    fn get_job_mode(&self) -> Result<JobMode, PropertiesError> {
        match self.get_string(JOB_MODE) {
            Ok(value) => JobMode::from_str(value.as_str()),
            Err(_) => Ok(JobMode::Batch),
        }
    }

    fn set_parallelism(&mut self, parallelism: u32) {
        self.set_u32(PARALLELISM, parallelism);
    }

    fn get_parallelism(&self) -> Result<u32, PropertiesError> {
        match self.get_u32(PARALLELISM) {
            Err(PropertiesError::None(_)) => Ok(1),
            r => r,
        }
    }

    fn set_checkpoint_interval(&mut self, interval: Duration) {
        self.set_duration_millis(CHECKPOINT_INTERVAL, interval);
    }

    fn get_checkpoint_interval(&self) -> Result<Duration, PropertiesError> {
        match self.get_duration_millis(CHECKPOINT_INTERVAL) {
            Err(PropertiesError::None(_)) => match self.get_job_mode()? {
                JobMode::Batch => Ok(Duration::ZERO),
                JobMode::Streaming => Ok(DEFAULT_STREAMING_CHECKPOINT_INTERVAL),
            },
            r => r,
        }
    }

    fn set_checkpoint_timeout(&mut self, timeout: Duration) {
        self.set_duration_millis(CHECKPOINT_TIMEOUT, timeout);
    }

    fn get_checkpoint_timeout(&self) -> Result<Duration, PropertiesError> {
        match self.get_duration_millis(CHECKPOINT_TIMEOUT) {
            Err(PropertiesError::None(_)) => Ok(DEFAULT_CHECKPOINT_TIMEOUT),
            r => r,
        }
    }

    fn set_restart_strategy(&mut self, strategy: RestartStrategy) {
        // an enum of plain numbers always serializes
        let value = serde_json::to_string(&strategy).unwrap_or_default();
        self.set_string(RESTART_STRATEGY.to_string(), value);
    }

    fn get_restart_strategy(&self) -> Result<RestartStrategy, PropertiesError> {
        match self.get_string(RESTART_STRATEGY) {
            Ok(value) => serde_json::from_str(value.as_str()).map_err(|e| PropertiesError::from(e)),
            Err(e) => Err(e),
        }
    }

    fn set_task_poll_idle(&mut self, idle: Duration) {
        self.set_duration_millis(TASK_POLL_IDLE, idle);
    }

    fn get_task_poll_idle(&self) -> Result<Duration, PropertiesError> {
        self.get_duration_millis(TASK_POLL_IDLE)
    }
}

#[derive(Debug)]
pub enum PropertiesError {
    None(String),
    ParseIntError(ParseIntError),
    JsonParseError(serde_json::Error),
    Unsupported(String),
}

impl PropertiesError {
    pub fn is_none(&self) -> bool {
        match self {
            PropertiesError::None(_) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PropertiesError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            PropertiesError::None(ref key) => write!(f, "property `{}` not found", key),
            PropertiesError::ParseIntError(ref err) => write!(f, "ParseIntError error: {}", err),
            PropertiesError::JsonParseError(ref err) => write!(f, "JsonParseError error: {}", err),
            PropertiesError::Unsupported(ref value) => write!(f, "unsupported value `{}`", value),
        }
    }
}

impl std::error::Error for PropertiesError {}

impl From<ParseIntError> for PropertiesError {
    fn from(e: ParseIntError) -> Self {
        PropertiesError::ParseIntError(e)
    }
}

impl From<serde_json::Error> for PropertiesError {
    fn from(e: serde_json::Error) -> Self {
        PropertiesError::JsonParseError(e)
    }
}
