use std::path::Path;
use std::time::Duration;

use crate::runtime::coordinator::restart::RestartStrategy;

pub const DEFAULT_SLOTS_PER_WORKER: u32 = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "param")]
pub enum CheckpointStorageType {
    Memory,
    LocalFile { dir: String },
}

impl std::fmt::Display for CheckpointStorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointStorageType::Memory => write!(f, "Memory"),
            CheckpointStorageType::LocalFile { dir } => write!(f, "LocalFile({})", dir),
        }
    }
}

/// Backoff of a task poll loop. After a poll that produced data the task yields for
/// `busy_yield_ms` so that queued control operations are picked up, or only gives up
/// its time slice when that is 0; after an empty poll it sleeps `idle_backoff_ms`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub idle_backoff_ms: u64,
    pub busy_yield_ms: u64,
}

impl PollPolicy {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn busy_yield(&self) -> Duration {
        Duration::from_millis(self.busy_yield_ms)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            idle_backoff_ms: 100,
            busy_yield_ms: 1,
        }
    }
}

/// Retries of a slot request that failed with insufficient resources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceRetry {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ResourceRetry {
    fn default() -> Self {
        ResourceRetry {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// workers started by a local cluster
    pub workers: u32,
    pub slots_per_worker: u32,
    pub checkpoint_storage: CheckpointStorageType,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// interval of the job master status loop
    pub job_master_poll_ms: u64,
    pub poll_policy: PollPolicy,
    /// used when the job does not configure `restart.strategy`
    pub restart_strategy: RestartStrategy,
    pub resource_retry: ResourceRetry,
    pub channel_capacity: usize,
    pub finished_job_history: usize,
    /// slot allocation events kept for inspection
    pub allocation_log_capacity: usize,
    pub metrics_address: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workers: 1,
            slots_per_worker: DEFAULT_SLOTS_PER_WORKER,
            checkpoint_storage: CheckpointStorageType::Memory,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 50 * 1000,
            job_master_poll_ms: 100,
            poll_policy: PollPolicy::default(),
            restart_strategy: RestartStrategy::FixedDelay {
                max_attempts: 3,
                delay_ms: 1000,
            },
            resource_retry: ResourceRetry::default(),
            channel_capacity: 1024,
            finished_job_history: 1024,
            allocation_log_capacity: 4096,
            metrics_address: None,
        }
    }
}

impl EngineConfig {
    pub fn new_local(workers: u32, slots_per_worker: u32) -> Self {
        EngineConfig {
            workers,
            slots_per_worker,
            ..Default::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn job_master_poll(&self) -> Duration {
        Duration::from_millis(self.job_master_poll_ms)
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    let context = crate::utils::fs::read_string(path)
        .map_err(|e| anyhow!("read engine config {:?} error. {}", path, e))?;
    parse_config(context.as_str())
}

pub fn parse_config(context: &str) -> anyhow::Result<EngineConfig> {
    let config: EngineConfig =
        serde_yaml::from_str(context).map_err(|e| anyhow!("parse engine config error. {}", e))?;
    if config.slots_per_worker == 0 {
        return Err(anyhow!("`slots_per_worker` must be positive"));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::api::cluster::{parse_config, CheckpointStorageType, EngineConfig};
    use crate::runtime::coordinator::restart::RestartStrategy;

    #[test]
    pub fn parse_config_test() {
        let yaml = r#"
workers: 3
checkpoint_storage:
  type: LocalFile
  param:
    dir: /tmp/rtunnel
restart_strategy:
  type: ExponentialBackoff
  param:
    max_attempts: 5
    initial_ms: 100
    max_ms: 2000
    multiplier: 2.0
poll_policy:
  idle_backoff_ms: 50
  busy_yield_ms: 1
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.slots_per_worker, 2);
        assert_eq!(
            config.checkpoint_storage,
            CheckpointStorageType::LocalFile {
                dir: "/tmp/rtunnel".to_string()
            }
        );
        assert_eq!(
            config.restart_strategy,
            RestartStrategy::ExponentialBackoff {
                max_attempts: 5,
                initial_ms: 100,
                max_ms: 2000,
                multiplier: 2.0,
            }
        );
        assert_eq!(config.poll_policy.idle_backoff_ms, 50);
        assert_eq!(config.heartbeat_timeout_ms, EngineConfig::default().heartbeat_timeout_ms);
    }

    #[test]
    pub fn default_poll_policy_test() {
        let config = parse_config("workers: 2").unwrap();
        assert_eq!(config.poll_policy.idle_backoff(), Duration::from_millis(100));
        assert_eq!(config.poll_policy.busy_yield(), Duration::from_millis(1));
    }

    #[test]
    pub fn reject_zero_slots_test() {
        assert!(parse_config("slots_per_worker: 0").is_err());
    }
}
