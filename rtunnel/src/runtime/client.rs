use std::sync::Arc;

use crate::api::config::JobConfig;
use crate::api::error::EngineError;
use crate::api::runtime::JobId;
use crate::dag::logical_plan::compile;
use crate::runtime::coordinator::job_master::JobResult;
use crate::runtime::server::EngineServer;
use crate::runtime::JobImmutableInformation;
use crate::utils::date_time::current_timestamp_millis;
use crate::utils::IdGenerator;

/// Submits job configs to an [`EngineServer`] and follows them to completion.
#[derive(Clone)]
pub struct JobClient {
    server: Arc<EngineServer>,
}

impl JobClient {
    pub fn new(server: Arc<EngineServer>) -> Self {
        JobClient { server }
    }

    pub fn server(&self) -> &Arc<EngineServer> {
        &self.server
    }

    /// Every job numbers its vertices from scratch, so the state keys of a job and of
    /// the job restored from it match.
    pub fn create_job(
        &self,
        config: &JobConfig,
        restore_from: Option<JobId>,
    ) -> Result<JobImmutableInformation, EngineError> {
        let logical_dag = compile(config, &IdGenerator::new())?;
        Ok(JobImmutableInformation {
            job_id: self.server.next_job_id(),
            job_name: config.name.clone(),
            env: config.env.clone(),
            logical_dag,
            submit_timestamp: current_timestamp_millis(),
            restore_from,
        })
    }

    /// Returns once the job is running.
    pub async fn submit(&self, config: &JobConfig) -> Result<JobId, EngineError> {
        let job_info = self.create_job(config, None)?;
        self.submit_job(job_info).await
    }

    /// Start `config` from the latest completed checkpoint or savepoint of `prior`.
    pub async fn restore(&self, config: &JobConfig, prior: JobId) -> Result<JobId, EngineError> {
        let job_info = self.create_job(config, Some(prior))?;
        info!("restore {} as {}", prior, job_info.job_id);
        self.submit_job(job_info).await
    }

    async fn submit_job(&self, job_info: JobImmutableInformation) -> Result<JobId, EngineError> {
        let job_id = job_info.job_id;
        let bytes = job_info.to_bytes()?;
        self.server.submit_job(job_id, bytes).await?;
        Ok(job_id)
    }

    pub async fn wait(&self, job_id: JobId) -> Result<JobResult, EngineError> {
        self.server.wait_for_job_complete(job_id).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<JobResult, EngineError> {
        self.server.cancel_job(job_id)?;
        self.wait(job_id).await
    }

    /// Checkpoint the job and stop it. The result can be restored with [`JobClient::restore`].
    pub async fn savepoint(&self, job_id: JobId) -> Result<JobResult, EngineError> {
        self.server.savepoint_job(job_id)?;
        self.wait(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::api::cluster::EngineConfig;
    use crate::api::config::{JobConfig, JobMode, Partitioner, PluginConfig};
    use crate::api::element::Row;
    use crate::api::error::EngineError;
    use crate::api::factory::ConnectorRegistry;
    use crate::api::properties::SystemProperties;
    use crate::api::runtime::PipelineId;
    use crate::functions::sink::collect::{clear_collection, collected, NAME};
    use crate::functions::source::vec_source::{BOUNDED, ROWS, ROWS_PER_POLL, SPLITS};
    use crate::functions::{default_registry, COLLECT_SINK, COPY_TRANSFORM, VEC_SOURCE};
    use crate::runtime::client::JobClient;
    use crate::runtime::coordinator::restart::RestartStrategy;
    use crate::runtime::resource::slot::AllocationEvent;
    use crate::runtime::server::EngineServer;
    use crate::runtime::{JobStatus, PipelineStatus};

    const FAIL_ONCE: &str = "FailOnce";

    const FAIL_ARMED: &str = "FailArmed";

    lazy_static! {
        static ref FAILED: AtomicBool = AtomicBool::new(false);
        static ref ARMED: AtomicBool = AtomicBool::new(false);
        static ref ARMED_FIRED: AtomicBool = AtomicBool::new(false);
    }

    fn client(workers: u32, slots: u32, registry: ConnectorRegistry) -> JobClient {
        let mut config = EngineConfig::new_local(workers, slots);
        config.job_master_poll_ms = 20;
        config.poll_policy.idle_backoff_ms = 5;
        config.resource_retry.backoff_ms = 50;
        let server = EngineServer::new(config, Arc::new(registry)).unwrap();
        JobClient::new(Arc::new(server))
    }

    fn fixed_delay() -> RestartStrategy {
        RestartStrategy::FixedDelay {
            max_attempts: 3,
            delay_ms: 50,
        }
    }

    fn job(name: &str, mode: JobMode, rows: u64, bounded: bool) -> JobConfig {
        let mut config = JobConfig::new(name);
        config.env.set_job_mode(mode);
        config.source.push(
            PluginConfig::new(VEC_SOURCE)
                .with_result_table("numbers")
                .with_parallelism(2)
                .with_property(ROWS, rows.to_string().as_str())
                .with_property(SPLITS, "4")
                .with_property(ROWS_PER_POLL, "2")
                .with_property(BOUNDED, if bounded { "true" } else { "false" }),
        );
        config.sink.push(collect(name, "numbers", 2));
        config
    }

    fn collect(name: &str, table: &str, parallelism: u32) -> PluginConfig {
        PluginConfig::new(COLLECT_SINK)
            .with_source_table(table)
            .with_parallelism(parallelism)
            .with_property(NAME, name)
    }

    fn numbers(rows: Vec<Row>) -> Vec<u64> {
        let mut numbers: Vec<u64> = rows
            .iter()
            .filter_map(|row| row.field(0).and_then(|v| v.as_u64()))
            .collect();
        numbers.sort();
        numbers
    }

    async fn wait_collected(name: &str, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while collected(name).len() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    pub async fn batch_job_test() {
        clear_collection("batch-job");
        let client = client(2, 4, default_registry());
        let config = job("batch-job", JobMode::Batch, 100, true);

        let job_id = client.submit(&config).await.unwrap();
        let result = client.wait(job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Finished);
        assert_eq!(result.error, None);
        assert_eq!(numbers(collected("batch-job")), (0..100).collect::<Vec<u64>>());

        // finished jobs are answered from the history
        assert_eq!(client.wait(job_id).await.unwrap(), result);
        assert_eq!(
            client.server().pipeline_status(job_id, PipelineId(1)).unwrap(),
            Some(PipelineStatus::Finished)
        );
        assert_eq!(client.server().cluster().resource_manager().free_slots(), 8);
        client.server().shutdown();
    }

    #[tokio::test]
    pub async fn batch_shuffle_test() {
        clear_collection("batch-shuffle");
        let client = client(2, 4, default_registry());
        let mut config = job("batch-shuffle", JobMode::Batch, 60, true);
        config.transform.push(
            PluginConfig::new(COPY_TRANSFORM)
                .with_source_table("numbers")
                .with_result_table("copied")
                .with_parallelism(3)
                .with_partitioner(Partitioner::Hash { field: 0 }),
        );
        config.sink[0] = collect("batch-shuffle", "copied", 3);

        let job_id = client.submit(&config).await.unwrap();
        let result = client.wait(job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Finished);

        let rows = collected("batch-shuffle");
        assert_eq!(numbers(rows.clone()), (0..60).collect::<Vec<u64>>());
        assert!(rows.iter().all(|row| row.fields.len() == 3));
        client.server().shutdown();
    }

    #[tokio::test]
    pub async fn restart_from_checkpoint_test() {
        clear_collection("fail-once");
        let mut registry = default_registry();
        registry.register_transform(FAIL_ONCE, |_| Ok(Box::new(FailOnce {}) as _));
        let client = client(1, 4, registry);

        let mut config = job("fail-once", JobMode::Streaming, 100, false);
        config.env.set_checkpoint_interval(Duration::from_millis(50));
        config.env.set_restart_strategy(fixed_delay());
        config.transform.push(
            PluginConfig::new(FAIL_ONCE)
                .with_source_table("numbers")
                .with_result_table("checked")
                .with_parallelism(2),
        );
        config.sink[0] = collect("fail-once", "checked", 2);

        let job_id = client.submit(&config).await.unwrap();
        wait_collected("fail-once", 100).await;
        assert!(FAILED.load(Ordering::SeqCst));
        assert_eq!(client.server().job_status(job_id).unwrap(), JobStatus::Running);

        let result = client.cancel(job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Canceled);
        assert_eq!(numbers(collected("fail-once")), (0..100).collect::<Vec<u64>>());
        client.server().shutdown();
    }

    #[tokio::test]
    pub async fn resume_from_completed_checkpoint_test() {
        let name = "fail-after-checkpoint";
        clear_collection(name);
        let mut registry = default_registry();
        registry.register_transform(FAIL_ARMED, |_| Ok(Box::new(FailArmed {}) as _));
        let client = client(1, 4, registry);

        let mut config = job(name, JobMode::Streaming, 400, true);
        config.env.set_checkpoint_interval(Duration::from_millis(50));
        config.env.set_restart_strategy(fixed_delay());
        config.transform.push(
            PluginConfig::new(FAIL_ARMED)
                .with_source_table("numbers")
                .with_result_table("checked")
                .with_parallelism(2),
        );
        config.sink[0] = collect(name, "checked", 2);

        let job_id = client.submit(&config).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            let checkpoint = client
                .server()
                .latest_checkpoint(job_id, PipelineId(1))
                .unwrap();
            if checkpoint.is_some() && !collected(name).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ARMED.store(true, Ordering::SeqCst);
        let committed = numbers(collected(name));
        assert!(!committed.is_empty());

        let result = client.wait(job_id).await.unwrap();
        assert!(ARMED_FIRED.load(Ordering::SeqCst));
        assert_eq!(result.status, JobStatus::Finished);

        let rows = collected(name);
        let after = numbers(rows[committed.len()..].to_vec());
        assert!(after.iter().all(|n| committed.binary_search(n).is_err()));
        assert_eq!(numbers(rows), (0..400).collect::<Vec<u64>>());
        client.server().shutdown();
    }

    #[tokio::test]
    pub async fn savepoint_and_restore_test() {
        clear_collection("savepoint");
        let client = client(1, 4, default_registry());
        let mut config = job("savepoint", JobMode::Streaming, 400, false);
        config.env.set_checkpoint_interval(Duration::from_secs(600));

        let job_id = client.submit(&config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = client.savepoint(job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Canceled);
        assert!(client
            .server()
            .latest_checkpoint(job_id, PipelineId(1))
            .unwrap()
            .is_some());
        let saved = collected("savepoint").len();

        let restored = client.restore(&config, job_id).await.unwrap();
        assert_ne!(restored, job_id);
        wait_collected("savepoint", 400).await;
        assert!(collected("savepoint").len() >= saved);

        client.cancel(restored).await.unwrap();
        assert_eq!(numbers(collected("savepoint")), (0..400).collect::<Vec<u64>>());
        client.server().shutdown();
    }

    #[tokio::test]
    pub async fn worker_lost_test() {
        clear_collection("worker-lost");
        let client = client(2, 4, default_registry());
        let mut config = job("worker-lost", JobMode::Streaming, 200, false);
        config.source[0] = config.source[0].clone().with_parallelism(1);
        config.sink[0] = collect("worker-lost", "numbers", 1);
        config.env.set_checkpoint_interval(Duration::from_millis(50));
        config.env.set_restart_strategy(fixed_delay());

        let job_id = client.submit(&config).await.unwrap();
        let resource_manager = client.server().cluster().resource_manager().clone();
        let slot_id = resource_manager
            .allocation_log()
            .iter()
            .find_map(|event| match event {
                AllocationEvent::Allocated { slot_id, owner } if owner.job_id == job_id => {
                    Some(*slot_id)
                }
                _ => None,
            })
            .unwrap();
        let worker_id = resource_manager.worker_of(slot_id).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.server().remove_worker(worker_id).unwrap();
        assert!(!client.server().cluster().workers().contains(&worker_id));

        wait_collected("worker-lost", 200).await;
        assert_eq!(client.server().job_status(job_id).unwrap(), JobStatus::Running);
        client.cancel(job_id).await.unwrap();
        assert_eq!(numbers(collected("worker-lost")), (0..200).collect::<Vec<u64>>());
        client.server().shutdown();
    }

    #[tokio::test]
    pub async fn definition_error_test() {
        let client = client(1, 2, default_registry());
        let mut config = job("bad-definition", JobMode::Batch, 10, true);
        config.sink[0] = collect("bad-definition", "missing", 2);

        let r = client.submit(&config).await;
        assert!(matches!(r, Err(EngineError::JobDefinition { .. })));
        assert_eq!(client.server().cluster().resource_manager().free_slots(), 2);
        assert!(client.server().running_jobs().is_empty());
        client.server().shutdown();
    }

    #[tokio::test]
    pub async fn insufficient_resources_test() {
        let client = client(1, 1, default_registry());
        let config = job("too-wide", JobMode::Batch, 10, true);

        let r = client.submit(&config).await;
        assert!(matches!(r, Err(EngineError::ResourceInsufficient { .. })));
        assert_eq!(client.server().cluster().resource_manager().free_slots(), 1);
        client.server().shutdown();
    }

    /// Fails on row 50 the first time it is seen.
    struct FailOnce {}

    impl crate::api::connector::Transform for FailOnce {
        fn map(&mut self, row: Row) -> anyhow::Result<Option<Row>> {
            let n = row.field(0).and_then(|v| v.as_u64());
            if n == Some(50) && !FAILED.swap(true, Ordering::SeqCst) {
                return Err(anyhow!("boom at row 50"));
            }
            Ok(Some(row))
        }
    }

    /// Slows every row down and fails on the first row seen once armed.
    struct FailArmed {}

    impl crate::api::connector::Transform for FailArmed {
        fn map(&mut self, row: Row) -> anyhow::Result<Option<Row>> {
            std::thread::sleep(Duration::from_millis(2));
            if ARMED.load(Ordering::SeqCst) && !ARMED_FIRED.swap(true, Ordering::SeqCst) {
                return Err(anyhow!("boom after checkpoint"));
            }
            Ok(Some(row))
        }
    }
}
