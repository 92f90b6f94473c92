//! Cluster wide entry point. The server owns the local cluster, the checkpoint storage
//! and the registry of submitted jobs; every job runs its job master on a dedicated
//! `JobMaster-{job}` thread.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::api::cluster::EngineConfig;
use crate::api::error::EngineError;
use crate::api::factory::ConnectorRegistry;
use crate::api::runtime::{CheckpointId, JobId, PipelineId, WorkerId};
use crate::channel::{unbounded, Sender};
use crate::metrics::metric::Gauge;
use crate::metrics::{init_metrics, register_gauge, spawn_reporter};
use crate::runtime::cluster::LocalCluster;
use crate::runtime::coordinator::job_master::{
    InitFuture, JobCommand, JobMaster, JobMasterContext, JobResult, JobView,
};
use crate::runtime::resource::LostWorker;
use crate::runtime::{JobImmutableInformation, JobStatus, PipelineStatus};
use crate::storage::checkpoint::CheckpointStorageWrap;
use crate::utils::date_time::current_timestamp_millis;
use crate::utils::future::CompletableFuture;
use crate::utils::thread::{join_thread, reap_finished, sleep_while, spawn};
use crate::utils::IdGenerator;

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(5);

struct RunningJob {
    view: Arc<JobView>,
    commands: Sender<JobCommand>,
    result: Arc<CompletableFuture<JobResult>>,
}

struct FinishedJob {
    view: Arc<JobView>,
    result: JobResult,
}

/// Running jobs plus a bounded history of the finished ones.
struct JobRegistry {
    running: DashMap<JobId, RunningJob>,
    history: Mutex<VecDeque<FinishedJob>>,
    history_capacity: usize,
    running_jobs: Gauge,
}

impl JobRegistry {
    fn finished(&self, job_id: JobId) -> Option<(Arc<JobView>, JobResult)> {
        let history = lock!(self.history, "job history").ok()?;
        history
            .iter()
            .rev()
            .find(|job| job.result.job_id == job_id)
            .map(|job| (job.view.clone(), job.result.clone()))
    }

    /// Moves the job into the history. The history entry exists before the running one
    /// is removed, so a lookup never misses the job.
    fn finish(&self, result: JobResult) {
        let view = self.running.get(&result.job_id).map(|job| job.view.clone());
        if let Some(view) = view {
            match lock!(self.history, "job history") {
                Ok(mut history) => {
                    history.push_back(FinishedJob {
                        view,
                        result: result.clone(),
                    });
                    while history.len() > self.history_capacity {
                        history.pop_front();
                    }
                }
                Err(e) => error!("record {} error. {}", result.job_id, e),
            }
        }
        if self.running.remove(&result.job_id).is_some() {
            self.running_jobs.fetch_sub(1);
        }
    }

    fn send(&self, job_id: JobId, command: JobCommand) -> Result<(), EngineError> {
        let sent = match self.running.get(&job_id) {
            Some(job) => job.commands.send(command).is_ok(),
            None => false,
        };
        if sent || self.finished(job_id).is_some() {
            // a finished job ignores commands
            Ok(())
        } else {
            Err(EngineError::JobNotFound(job_id))
        }
    }

    fn dispatch_worker_lost(&self, lost: LostWorker) {
        let job_ids: BTreeSet<JobId> = lost.lost.iter().map(|owner| owner.job_id).collect();
        for job_id in job_ids {
            if let Some(job) = self.running.get(&job_id) {
                if job
                    .commands
                    .send(JobCommand::WorkerLost(lost.clone()))
                    .is_err()
                {
                    warn!("{} is gone, drop loss of {}", job_id, lost.worker_id);
                }
            }
        }
    }
}

pub struct EngineServer {
    config: EngineConfig,
    cluster: Arc<LocalCluster>,
    context: JobMasterContext,
    jobs: Arc<JobRegistry>,
    job_ids: IdGenerator,

    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    job_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineServer {
    /// Start the local cluster with `config.workers` workers and the liveness monitor.
    pub fn new(config: EngineConfig, registry: Arc<ConnectorRegistry>) -> anyhow::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();
        if let Some(address) = config.metrics_address.as_ref() {
            init_metrics(address.as_str())?;
            threads.push(spawn_reporter(METRICS_REPORT_INTERVAL, running.clone())?);
        }

        let checkpoint_storage = CheckpointStorageWrap::new(&config.checkpoint_storage)?;
        let cluster = Arc::new(LocalCluster::new(config.clone(), registry));
        for _ in 0..config.workers {
            cluster.add_worker()?;
        }

        let jobs = Arc::new(JobRegistry {
            running: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_capacity: config.finished_job_history.max(1),
            running_jobs: register_gauge("running_jobs", vec![]),
        });
        threads.push(start_monitor(
            cluster.clone(),
            jobs.clone(),
            config.heartbeat_interval(),
            running.clone(),
        )?);

        let context = JobMasterContext {
            config: config.clone(),
            cluster: cluster.clone(),
            checkpoint_storage: Arc::new(Mutex::new(checkpoint_storage)),
            id_generator: Arc::new(IdGenerator::new()),
        };
        info!(
            "engine server started: {} workers, {} slots",
            config.workers,
            cluster.resource_manager().total_slots()
        );

        Ok(EngineServer {
            config,
            cluster,
            context,
            jobs,
            job_ids: IdGenerator::with_start(current_timestamp_millis()),
            running,
            threads: Mutex::new(threads),
            job_threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<LocalCluster> {
        &self.cluster
    }

    pub fn next_job_id(&self) -> JobId {
        JobId(self.job_ids.next_id())
    }

    /// Resolves once the job reached RUNNING, or with the error that kept it from
    /// getting there.
    pub async fn submit_job(
        &self,
        job_id: JobId,
        job_information: Vec<u8>,
    ) -> Result<(), EngineError> {
        let init_future = self.start_job(job_id, job_information.as_slice())?;
        match init_future.future().await {
            Ok(result) => result,
            Err(e) => Err(EngineError::from(e)),
        }
    }

    fn start_job(&self, job_id: JobId, bytes: &[u8]) -> Result<Arc<InitFuture>, EngineError> {
        let job_info = JobImmutableInformation::from_bytes(bytes)?;
        if job_info.job_id != job_id {
            return Err(EngineError::Wire(format!(
                "{} submitted with the information of {}",
                job_id, job_info.job_id
            )));
        }
        if self.jobs.running.contains_key(&job_id) || self.jobs.finished(job_id).is_some() {
            return Err(EngineError::Internal(format!("{} already submitted", job_id)));
        }

        let view = Arc::new(JobView::new(job_id, job_info.job_name.as_str()));
        let init_future = Arc::new(InitFuture::new());
        let result = Arc::new(CompletableFuture::new());
        let (commands, command_receiver) = unbounded();
        self.jobs.running.insert(
            job_id,
            RunningJob {
                view: view.clone(),
                commands,
                result: result.clone(),
            },
        );
        self.jobs.running_jobs.fetch_add(1);
        info!("submit {} `{}`", job_id, job_info.job_name);

        let context = self.context.clone();
        let jobs = self.jobs.clone();
        let init = init_future.clone();
        let thread = spawn(format!("JobMaster-{}", job_id.0).as_str(), move || {
            let job_result =
                match JobMaster::init(job_info, context, view.clone(), init.clone(), command_receiver)
                {
                    Ok(job_master) => job_master.run(),
                    Err(e) => {
                        error!("init {} error. {}", job_id, e);
                        view.set_status(JobStatus::Failed);
                        init.complete(Err(e.clone()));
                        JobResult {
                            job_id,
                            status: JobStatus::Failed,
                            error: Some(e),
                        }
                    }
                };
            jobs.finish(job_result.clone());
            result.complete(job_result);
        });

        match thread {
            Ok(thread) => {
                match lock!(self.job_threads, "job threads") {
                    Ok(mut threads) => {
                        reap_finished(&mut threads);
                        threads.push(thread);
                    }
                    Err(e) => warn!("track thread of {} error. {}", job_id, e),
                }
                Ok(init_future)
            }
            Err(e) => {
                self.jobs.running.remove(&job_id);
                self.jobs.running_jobs.fetch_sub(1);
                Err(EngineError::from(e))
            }
        }
    }

    /// The final result of a job. A job that finished before the call resolves from the
    /// history; an id this server never ran fails with `JobNotFound`.
    pub async fn wait_for_job_complete(&self, job_id: JobId) -> Result<JobResult, EngineError> {
        let future = self.jobs.running.get(&job_id).map(|job| job.result.future());
        match future {
            Some(future) => future.await.map_err(EngineError::from),
            None => self
                .jobs
                .finished(job_id)
                .map(|(_, result)| result)
                .ok_or(EngineError::JobNotFound(job_id)),
        }
    }

    pub fn cancel_job(&self, job_id: JobId) -> Result<(), EngineError> {
        self.jobs.send(job_id, JobCommand::Cancel)
    }

    /// Checkpoint every running pipeline, then cancel the job.
    pub fn savepoint_job(&self, job_id: JobId) -> Result<(), EngineError> {
        self.jobs.send(job_id, JobCommand::Savepoint)
    }

    pub fn trigger_checkpoint(&self, job_id: JobId) -> Result<(), EngineError> {
        self.jobs.send(job_id, JobCommand::TriggerCheckpoint)
    }

    fn view_of(&self, job_id: JobId) -> Result<Arc<JobView>, EngineError> {
        if let Some(job) = self.jobs.running.get(&job_id) {
            return Ok(job.view.clone());
        }
        self.jobs
            .finished(job_id)
            .map(|(view, _)| view)
            .ok_or(EngineError::JobNotFound(job_id))
    }

    pub fn job_status(&self, job_id: JobId) -> Result<JobStatus, EngineError> {
        self.view_of(job_id).map(|view| view.status())
    }

    pub fn pipeline_status(
        &self,
        job_id: JobId,
        pipeline_id: PipelineId,
    ) -> Result<Option<PipelineStatus>, EngineError> {
        self.view_of(job_id)
            .map(|view| view.pipeline_status(pipeline_id))
    }

    pub fn latest_checkpoint(
        &self,
        job_id: JobId,
        pipeline_id: PipelineId,
    ) -> Result<Option<CheckpointId>, EngineError> {
        self.view_of(job_id)
            .map(|view| view.latest_checkpoint(pipeline_id))
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut job_ids: Vec<JobId> = self.jobs.running.iter().map(|j| *j.key()).collect();
        job_ids.sort();
        job_ids
    }

    pub fn add_worker(&self) -> anyhow::Result<WorkerId> {
        let worker_id = self.cluster.add_worker()?;
        info!("{} joined", worker_id);
        Ok(worker_id)
    }

    /// Membership removal: the task groups on the worker are lost and their jobs told so.
    pub fn remove_worker(&self, worker_id: WorkerId) -> anyhow::Result<()> {
        if let Some(lost) = self.cluster.remove_worker(worker_id)? {
            info!("{} left, {} slots lost", worker_id, lost.lost.len());
            self.jobs.dispatch_worker_lost(lost);
        }
        Ok(())
    }

    /// Cancel every job and stop the cluster.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for job_id in self.running_jobs() {
            if let Err(e) = self.cancel_job(job_id) {
                warn!("cancel {} error. {}", job_id, e);
            }
        }

        let job_threads = match lock!(self.job_threads, "job threads") {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(_) => Vec::new(),
        };
        for thread in job_threads {
            join_thread(thread);
        }

        let threads = match lock!(self.threads, "server threads") {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(_) => Vec::new(),
        };
        for thread in threads {
            join_thread(thread);
        }
        self.cluster.shutdown();
        info!("engine server shutdown");
    }
}

/// Workers whose heartbeat expired are treated like removed members.
fn start_monitor(
    cluster: Arc<LocalCluster>,
    jobs: Arc<JobRegistry>,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    spawn("Monitor-heartbeat", move || {
        while running.load(Ordering::SeqCst) {
            sleep_while(interval, || running.load(Ordering::SeqCst));
            let expired = match cluster.resource_manager().check_heartbeats(Instant::now()) {
                Ok(expired) => expired,
                Err(e) => {
                    error!("check heartbeats error. {}", e);
                    continue;
                }
            };
            for lost in expired {
                warn!(
                    "{} heartbeat timeout, {} slots lost",
                    lost.worker_id,
                    lost.lost.len()
                );
                cluster.evict_worker(lost.worker_id);
                jobs.dispatch_worker_lost(lost);
            }
        }
        info!("heartbeat monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::api::cluster::EngineConfig;
    use crate::api::config::{JobConfig, JobMode, PluginConfig};
    use crate::api::error::EngineError;
    use crate::api::properties::SystemProperties;
    use crate::api::runtime::JobId;
    use crate::functions::source::vec_source::ROWS;
    use crate::functions::{default_registry, PRINT_SINK, VEC_SOURCE};
    use crate::runtime::client::JobClient;
    use crate::runtime::server::EngineServer;
    use crate::runtime::JobStatus;

    #[tokio::test]
    pub async fn unknown_job_test() {
        let server =
            EngineServer::new(EngineConfig::new_local(1, 2), Arc::new(default_registry())).unwrap();
        let r = server.wait_for_job_complete(JobId(42)).await;
        assert_eq!(r, Err(EngineError::JobNotFound(JobId(42))));
        assert_eq!(
            server.cancel_job(JobId(42)),
            Err(EngineError::JobNotFound(JobId(42)))
        );
        server.shutdown();
    }

    #[tokio::test]
    pub async fn malformed_submission_test() {
        let server =
            EngineServer::new(EngineConfig::new_local(1, 2), Arc::new(default_registry())).unwrap();
        let r = server.submit_job(JobId(1), b"garbage".to_vec()).await;
        assert!(matches!(r, Err(EngineError::Wire(_))));
        assert!(server.running_jobs().is_empty());
        server.shutdown();
    }

    #[tokio::test]
    pub async fn finished_job_threads_released_test() {
        let mut config = EngineConfig::new_local(1, 2);
        config.job_master_poll_ms = 20;
        config.poll_policy.idle_backoff_ms = 5;
        let server = Arc::new(EngineServer::new(config, Arc::new(default_registry())).unwrap());
        let client = JobClient::new(server.clone());

        let mut job = JobConfig::new("short-job");
        job.env.set_job_mode(JobMode::Batch);
        job.source.push(
            PluginConfig::new(VEC_SOURCE)
                .with_result_table("numbers")
                .with_parallelism(1)
                .with_property(ROWS, "10"),
        );
        job.sink.push(
            PluginConfig::new(PRINT_SINK)
                .with_source_table("numbers")
                .with_parallelism(1),
        );

        for _ in 0..3 {
            let job_id = client.submit(&job).await.unwrap();
            let result = client.wait(job_id).await.unwrap();
            assert_eq!(result.status, JobStatus::Finished);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline
            && !server
                .job_threads
                .lock()
                .unwrap()
                .iter()
                .all(|t| t.is_finished())
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // ended job masters are joined when the next one starts
        let job_id = client.submit(&job).await.unwrap();
        assert_eq!(server.job_threads.lock().unwrap().len(), 1);
        client.wait(job_id).await.unwrap();
        server.shutdown();
    }
}
