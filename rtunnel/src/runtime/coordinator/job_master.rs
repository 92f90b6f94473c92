//! One job master per submitted job. It owns the physical plan, deploys the pipelines
//! in dependency order, tracks every task state reported by the workers and is the only
//! place where restart-or-fail is decided.
//!
//! Job status: `CREATED -> SCHEDULED -> RUNNING -> {FINISHED | FAILED | CANCELED}`, with
//! `RUNNING -> FAILING -> RUNNING` while a failed pipeline restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::api::action::Action;
use crate::api::checkpoint::{CheckpointBarrier, CheckpointType, CompletedCheckpoint, StateKey};
use crate::api::cluster::EngineConfig;
use crate::api::error::EngineError;
use crate::api::properties::{
    SystemProperties, CHECKPOINT_INTERVAL, CHECKPOINT_TIMEOUT, RESTART_STRATEGY,
};
use crate::api::runtime::{
    CheckpointId, JobId, PipelineId, SlotId, TaskGroupId, TaskId, TaskLocation, VertexId,
    WorkerId,
};
use crate::channel::select::ChannelSelect;
use crate::channel::{unbounded, Receiver, Sender, TryRecvError};
use crate::dag::logical_dag::LogicalDag;
use crate::dag::physical_plan::{compile, PhysicalPlan, Pipeline};
use crate::metrics::metric::{unregister, Counter};
use crate::metrics::{register_counter, Tag};
use crate::runtime::cluster::LocalCluster;
use crate::runtime::coordinator::checkpoint_coordinator::{
    CheckpointCoordinator, TriggerOutcome,
};
use crate::runtime::coordinator::restart::RestartPolicy;
use crate::runtime::resource::slot::{SlotAllocation, SlotProfile};
use crate::runtime::resource::LostWorker;
use crate::runtime::wire::{
    ControlOp, IntermediateInput, IntermediateOutput, LocalEdge, OperationMessage,
    TaskDeployment, TaskEvent, TaskGroupDeployment, TaskRole,
};
use crate::runtime::{ExecutionState, JobImmutableInformation, JobStatus, PipelineStatus};
use crate::storage::checkpoint::CheckpointStorageWrap;
use crate::utils::date_time::current_timestamp_millis;
use crate::utils::future::CompletableFuture;
use crate::utils::IdGenerator;

pub type InitFuture = CompletableFuture<Result<(), EngineError>>;

/// Requests of the server to a running job master.
#[derive(Clone, Debug)]
pub enum JobCommand {
    Cancel,
    /// checkpoint every pipeline, then cancel the job
    Savepoint,
    TriggerCheckpoint,
    WorkerLost(LostWorker),
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub error: Option<EngineError>,
}

/// Read side of a job master, shared with the query APIs of the server.
pub struct JobView {
    job_id: JobId,
    job_name: String,
    status: RwLock<JobStatus>,
    pipelines: DashMap<PipelineId, PipelineStatus>,
    latest_checkpoints: DashMap<PipelineId, CheckpointId>,
}

impl JobView {
    pub fn new(job_id: JobId, job_name: &str) -> Self {
        JobView {
            job_id,
            job_name: job_name.to_string(),
            status: RwLock::new(JobStatus::Created),
            pipelines: DashMap::new(),
            latest_checkpoints: DashMap::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_name(&self) -> &str {
        self.job_name.as_str()
    }

    pub fn status(&self) -> JobStatus {
        match self.status.read() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        match self.status.write() {
            Ok(mut s) => *s = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
    }

    pub fn pipeline_status(&self, pipeline_id: PipelineId) -> Option<PipelineStatus> {
        self.pipelines.get(&pipeline_id).map(|s| *s.value())
    }

    pub fn latest_checkpoint(&self, pipeline_id: PipelineId) -> Option<CheckpointId> {
        self.latest_checkpoints.get(&pipeline_id).map(|c| *c.value())
    }
}

/// Collaborators shared by all job masters of one server.
#[derive(Clone)]
pub struct JobMasterContext {
    pub config: EngineConfig,
    pub cluster: Arc<LocalCluster>,
    pub checkpoint_storage: Arc<Mutex<CheckpointStorageWrap>>,
    pub id_generator: Arc<IdGenerator>,
}

struct PipelineRuntime {
    status: PipelineStatus,
    coordinator: CheckpointCoordinator,
    policy: Box<dyn RestartPolicy>,
    attempts: u32,
    restart_at: Option<Instant>,
    failure: Option<EngineError>,
    /// stop requested by a savepoint or by the job
    canceling: bool,
    savepoint_done: bool,
    /// task states the next deployment starts from
    restore: Option<CompletedCheckpoint>,
    slot_workers: HashMap<SlotId, WorkerId>,
    restarts: Counter,
}

pub struct JobMaster {
    job_info: JobImmutableInformation,
    context: JobMasterContext,
    plan: PhysicalPlan,
    checkpoint_enabled: bool,
    pipelines: BTreeMap<PipelineId, PipelineRuntime>,

    view: Arc<JobView>,
    init_future: Arc<InitFuture>,
    commands: Receiver<JobCommand>,
    commands_closed: bool,
    events: Receiver<Vec<u8>>,
    event_sender: Sender<Vec<u8>>,

    status: JobStatus,
    stopping: Option<JobStatus>,
    savepoint: bool,
    error: Option<EngineError>,
}

impl JobMaster {
    /// Compile the physical plan and set up checkpointing. Nothing is deployed yet.
    pub fn init(
        job_info: JobImmutableInformation,
        context: JobMasterContext,
        view: Arc<JobView>,
        init_future: Arc<InitFuture>,
        commands: Receiver<JobCommand>,
    ) -> Result<Self, EngineError> {
        let job_id = job_info.job_id;
        let job_name = job_info.job_name.clone();
        let plan = compile(
            &job_info.logical_dag,
            &job_info,
            current_timestamp_millis(),
            context.id_generator.as_ref(),
        )?;

        let interval = job_info
            .env
            .get_checkpoint_interval()
            .map_err(|e| EngineError::job_definition(job_name.as_str(), CHECKPOINT_INTERVAL, e))?;
        let timeout = job_info
            .env
            .get_checkpoint_timeout()
            .map_err(|e| EngineError::job_definition(job_name.as_str(), CHECKPOINT_TIMEOUT, e))?;
        let strategy = match job_info.env.get_restart_strategy() {
            Ok(strategy) => strategy,
            Err(e) if e.is_none() => context.config.restart_strategy.clone(),
            Err(e) => {
                return Err(EngineError::job_definition(
                    job_name.as_str(),
                    RESTART_STRATEGY,
                    e,
                ))
            }
        };

        let checkpoint_enabled = interval > Duration::ZERO;
        if checkpoint_enabled {
            info!("{} checkpoint is enabled, interval {:?}", job_id, interval);
        } else {
            info!("{} checkpoint is disabled", job_id);
        }

        for pipeline in &plan.pipelines {
            for edge in &pipeline.downstream {
                context.cluster.store().register(
                    edge.dataset_id(job_id),
                    edge.partitions,
                    edge.producer_parallelism,
                );
            }
        }

        let mut pipelines = BTreeMap::new();
        for pipeline in &plan.pipelines {
            let pipeline_id = pipeline.pipeline_id;
            let mut coordinator = CheckpointCoordinator::new(
                job_id,
                pipeline_id,
                context.checkpoint_storage.clone(),
                interval,
                timeout,
            );
            let restore = match job_info.restore_from {
                Some(prior_job_id) => {
                    let restored = coordinator.restore(prior_job_id)?;
                    if restored.is_none() {
                        warn!(
                            "no completed checkpoint of {} in {}, {} starts from scratch",
                            pipeline_id, prior_job_id, job_id
                        );
                    }
                    restored
                }
                None => None,
            };

            view.pipelines.insert(pipeline_id, PipelineStatus::Created);
            pipelines.insert(
                pipeline_id,
                PipelineRuntime {
                    status: PipelineStatus::Created,
                    coordinator,
                    policy: strategy.create_policy(),
                    attempts: 0,
                    restart_at: None,
                    failure: None,
                    canceling: false,
                    savepoint_done: false,
                    restore,
                    slot_workers: HashMap::new(),
                    restarts: register_counter(
                        "pipeline_restarts",
                        vec![
                            Tag::new("job_id", job_id.0),
                            Tag::new("pipeline_id", pipeline_id.0),
                        ],
                    ),
                },
            );
        }

        info!(
            "{} `{}` initialized: {} pipelines, {} tasks",
            job_id,
            job_name,
            plan.pipelines.len(),
            plan.physical_vertex_count() + plan.coordinator_vertex_count()
        );

        let (event_sender, events) = unbounded();
        Ok(JobMaster {
            job_info,
            context,
            plan,
            checkpoint_enabled,
            pipelines,
            view,
            init_future,
            commands,
            commands_closed: false,
            events,
            event_sender,
            status: JobStatus::Created,
            stopping: None,
            savepoint: false,
            error: None,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_info.job_id
    }

    pub fn plan(&self) -> &PhysicalPlan {
        &self.plan
    }

    /// Blocks until the job reached a terminal status.
    pub fn run(mut self) -> JobResult {
        self.set_status(JobStatus::Scheduled);
        self.schedule_pipelines();
        self.refresh_status();

        let poll = self.context.config.job_master_poll();
        while !self.check_job_done() {
            {
                let mut select = ChannelSelect::new();
                select.recv_raw(&self.events);
                if !self.commands_closed {
                    select.recv_raw(&self.commands);
                }
                select.ready_timeout(poll);
            }

            loop {
                match self.commands.try_recv() {
                    Ok(command) => self.on_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if !self.commands_closed {
                            self.commands_closed = true;
                            warn!("{} lost its server, cancel", self.job_id());
                            self.stop_job(JobStatus::Canceled, None);
                        }
                        break;
                    }
                }
            }
            while let Ok(bytes) = self.events.try_recv() {
                self.on_event(bytes.as_slice());
            }
            self.on_tick(Instant::now());
        }

        self.cleanup();
        let result = JobResult {
            job_id: self.job_id(),
            status: self.status,
            error: self.error.clone(),
        };
        let init_result = match result.status {
            JobStatus::Finished => Ok(()),
            _ => Err(self
                .error
                .clone()
                .unwrap_or_else(|| EngineError::Canceled(self.job_id().to_string()))),
        };
        // no-op when the job already reached RUNNING
        self.init_future.complete(init_result);

        info!("{} completed with {}", self.job_id(), self.status);
        result
    }

    fn set_status(&mut self, status: JobStatus) {
        if self.status == status {
            return;
        }
        info!("{} status {} -> {}", self.job_id(), self.status, status);
        self.status = status;
        self.view.set_status(status);
        if status == JobStatus::Running {
            self.init_future.complete(Ok(()));
        }
    }

    fn refresh_status(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        let any = |status: PipelineStatus| self.pipelines.values().any(|p| p.status == status);
        let status = match self.stopping {
            Some(JobStatus::Failed) => JobStatus::Failing,
            Some(_) => self.status,
            None if any(PipelineStatus::Failing) => JobStatus::Failing,
            None if any(PipelineStatus::Running) || any(PipelineStatus::Finished) => {
                JobStatus::Running
            }
            None => self.status,
        };
        self.set_status(status);
    }

    fn check_job_done(&mut self) -> bool {
        if !self.pipelines.values().all(|p| p.status.is_terminal()) {
            return false;
        }

        let all_finished = self
            .pipelines
            .values()
            .all(|p| p.status == PipelineStatus::Finished);
        let status = if all_finished {
            JobStatus::Finished
        } else {
            match self.stopping {
                Some(status) => status,
                None if self
                    .pipelines
                    .values()
                    .any(|p| p.status == PipelineStatus::Failed) =>
                {
                    JobStatus::Failed
                }
                None => JobStatus::Canceled,
            }
        };
        self.set_status(status);
        true
    }

    fn set_pipeline_status(&mut self, pipeline_id: PipelineId, status: PipelineStatus) {
        if let Some(rt) = self.pipelines.get_mut(&pipeline_id) {
            if rt.status != status {
                info!(
                    "{}/{} status {} -> {}",
                    self.job_info.job_id, pipeline_id, rt.status, status
                );
                rt.status = status;
                self.view.pipelines.insert(pipeline_id, status);
            }
        }
    }

    fn pipeline_status(&self, pipeline_id: PipelineId) -> Option<PipelineStatus> {
        self.pipelines.get(&pipeline_id).map(|rt| rt.status)
    }

    /// Deploy every pipeline whose blocking upstream pipelines all finished.
    fn schedule_pipelines(&mut self) {
        if self.stopping.is_some() || self.savepoint {
            return;
        }

        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for pipeline in &self.plan.pipelines {
            match self.pipeline_status(pipeline.pipeline_id) {
                Some(PipelineStatus::Created) | Some(PipelineStatus::Waiting) => {}
                _ => continue,
            }
            let upstream_finished = pipeline
                .blocking_upstream_pipelines()
                .iter()
                .all(|p| self.pipeline_status(*p) == Some(PipelineStatus::Finished));
            if upstream_finished {
                ready.push(pipeline.pipeline_id);
            } else {
                waiting.push(pipeline.pipeline_id);
            }
        }

        for pipeline_id in waiting {
            self.set_pipeline_status(pipeline_id, PipelineStatus::Waiting);
        }
        for pipeline_id in ready {
            if let Err(e) = self.deploy_pipeline(pipeline_id) {
                self.pipeline_failed(pipeline_id, e);
            }
        }
        self.refresh_status();
    }

    fn deploy_pipeline(&mut self, pipeline_id: PipelineId) -> Result<(), EngineError> {
        let job_id = self.job_info.job_id;
        let mut pipeline = self
            .plan
            .pipeline(pipeline_id)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("{} not found", pipeline_id)))?;

        let profiles: Vec<SlotProfile> = pipeline
            .task_groups
            .iter()
            .map(|g| SlotProfile {
                task_group_id: g.task_group_id,
            })
            .collect();
        let retry = self.context.config.resource_retry.clone();
        let resource_manager = self.context.cluster.resource_manager().clone();
        let allocations: Vec<SlotAllocation> = retry_fn!(
            resource_manager.apply_resources(job_id, pipeline_id, profiles.as_slice()),
            Duration::from_millis(retry.backoff_ms),
            retry.attempts.max(1) as usize
        )?;
        self.set_pipeline_status(pipeline_id, PipelineStatus::Scheduled);

        let allocations: HashMap<TaskGroupId, SlotAllocation> = allocations
            .into_iter()
            .map(|a| (a.task_group_id, a))
            .collect();

        // enumerators are deployed with the locations of their readers
        for group in pipeline.task_groups.clone() {
            let allocation = allocations.get(&group.task_group_id).ok_or_else(|| {
                EngineError::Internal(format!("{} got no slot", group.task_group_id))
            })?;
            for task_id in group.task_ids {
                pipeline.set_location(
                    task_id,
                    TaskLocation::new(allocation.slot_id, group.task_group_id, task_id),
                );
            }
        }

        let restore = self
            .pipelines
            .get(&pipeline_id)
            .and_then(|rt| rt.restore.clone());
        let deployments = build_deployments(
            job_id,
            &self.job_info.logical_dag,
            &pipeline,
            &allocations,
            restore.as_ref(),
        )?;

        if let Some(p) = self.plan.pipeline_mut(pipeline_id) {
            *p = pipeline;
        }
        if let Some(rt) = self.pipelines.get_mut(&pipeline_id) {
            rt.slot_workers = allocations
                .values()
                .map(|a| (a.slot_id, a.worker_id))
                .collect();
        }

        for (worker_id, deployment) in deployments {
            self.context
                .cluster
                .deploy(worker_id, &deployment, self.event_sender.clone())?;
            for task in &deployment.tasks {
                self.set_task_state(pipeline_id, task.task_id, ExecutionState::Deploying);
            }
            debug!(
                "{} with {} tasks deployed to {} of {}",
                deployment.task_group_id,
                deployment.tasks.len(),
                deployment.slot_id,
                worker_id
            );
        }

        self.set_pipeline_status(pipeline_id, PipelineStatus::Running);
        Ok(())
    }

    fn set_task_state(&mut self, pipeline_id: PipelineId, task_id: TaskId, state: ExecutionState) {
        if let Some(pipeline) = self.plan.pipeline_mut(pipeline_id) {
            pipeline.set_state(task_id, state);
        }
    }

    fn task_state(&self, pipeline_id: PipelineId, task_id: TaskId) -> Option<ExecutionState> {
        let pipeline = self.plan.pipeline(pipeline_id)?;
        pipeline
            .physical_vertex(task_id)
            .map(|v| v.state)
            .or_else(|| pipeline.coordinator_vertex(task_id).map(|v| v.state))
    }

    /// Whether `location` is a task of the current generation.
    fn is_current(&self, pipeline_id: PipelineId, location: &TaskLocation) -> bool {
        let pipeline = match self.plan.pipeline(pipeline_id) {
            Some(pipeline) => pipeline,
            None => return false,
        };
        let deployed_at = pipeline
            .physical_vertex(location.task_id)
            .map(|v| v.location)
            .or_else(|| {
                pipeline
                    .coordinator_vertex(location.task_id)
                    .map(|v| v.location)
            });
        deployed_at == Some(Some(*location))
    }

    fn task_name(&self, pipeline_id: PipelineId, task_id: TaskId) -> String {
        let pipeline = match self.plan.pipeline(pipeline_id) {
            Some(pipeline) => pipeline,
            None => return task_id.to_string(),
        };
        let dag = &self.job_info.logical_dag;
        if let Some(v) = pipeline.physical_vertex(task_id) {
            if let Some(vertex) = dag.vertex(v.vertex_id) {
                return format!("{}-{}", vertex.name(), v.subtask_index);
            }
        } else if let Some(v) = pipeline.coordinator_vertex(task_id) {
            if let Some(vertex) = dag.vertex(v.vertex_id) {
                return format!("{}-enumerator", vertex.name());
            }
        }
        task_id.to_string()
    }

    fn on_command(&mut self, command: JobCommand) {
        info!("{} received {:?}", self.job_id(), command);
        match command {
            JobCommand::Cancel => self.stop_job(JobStatus::Canceled, None),
            JobCommand::Savepoint => self.start_savepoint(),
            JobCommand::TriggerCheckpoint => {
                let running: Vec<PipelineId> = self
                    .pipelines
                    .iter()
                    .filter(|(_, rt)| rt.status == PipelineStatus::Running && !rt.canceling)
                    .map(|(id, _)| *id)
                    .collect();
                for pipeline_id in running {
                    self.trigger(pipeline_id, CheckpointType::Checkpoint);
                }
            }
            JobCommand::WorkerLost(lost) => self.on_worker_lost(lost),
        }
    }

    fn on_event(&mut self, bytes: &[u8]) {
        let event = match TaskEvent::decode(bytes) {
            Ok(event) => event,
            Err(e) => {
                error!("{} drop undecodable task event. {}", self.job_id(), e);
                return;
            }
        };
        if event.job_id() != self.job_id() {
            warn!("{} drop event of {}", self.job_id(), event.job_id());
            return;
        }

        match event {
            TaskEvent::StateChanged {
                pipeline_id,
                task,
                state,
                error,
                final_state,
                ..
            } => self.on_task_state(pipeline_id, task, state, error, final_state),
            TaskEvent::CheckpointAck(ack) => {
                if !self.is_current(ack.pipeline_id, &ack.task) {
                    debug!("ignore ack of stale {}", ack.task);
                    return;
                }
                let result = match self.pipelines.get_mut(&ack.pipeline_id) {
                    Some(rt) => rt.coordinator.acknowledge(
                        ack.checkpoint_id,
                        ack.task.task_id,
                        ack.state_key,
                        ack.state,
                    ),
                    None => return,
                };
                self.on_checkpoint_result(ack.pipeline_id, result);
            }
            TaskEvent::CheckpointDecline {
                pipeline_id,
                checkpoint_id,
                task,
                reason,
                ..
            } => {
                if !self.is_current(pipeline_id, &task) {
                    return;
                }
                if let Some(rt) = self.pipelines.get_mut(&pipeline_id) {
                    rt.coordinator
                        .decline(checkpoint_id, task.task_id, reason.as_str());
                }
            }
        }
    }

    fn on_task_state(
        &mut self,
        pipeline_id: PipelineId,
        location: TaskLocation,
        state: ExecutionState,
        error: Option<String>,
        final_state: Option<(StateKey, Vec<u8>)>,
    ) {
        if !self.is_current(pipeline_id, &location) {
            debug!("ignore {} of stale {}", state, location);
            return;
        }
        let task_id = location.task_id;
        match self.task_state(pipeline_id, task_id) {
            Some(current) if !current.is_terminal() => {}
            _ => return,
        }
        self.set_task_state(pipeline_id, task_id, state);

        match state {
            ExecutionState::Finished => {
                let result = match self.pipelines.get_mut(&pipeline_id) {
                    Some(rt) => rt.coordinator.task_finished(task_id, final_state),
                    None => return,
                };
                self.on_checkpoint_result(pipeline_id, result);
            }
            ExecutionState::Failed => {
                let task = self.task_name(pipeline_id, task_id);
                let reason = error.unwrap_or_else(|| "unknown".to_string());
                if self.is_canceling(pipeline_id) {
                    warn!("{} failed while stopping. {}", task, reason);
                } else {
                    self.pipeline_failed(pipeline_id, EngineError::TaskExecution { task, reason });
                }
            }
            ExecutionState::Canceled => {
                if !self.is_canceling(pipeline_id) {
                    let err = self.unexpected_cancel(pipeline_id, &location);
                    self.pipeline_failed(pipeline_id, err);
                }
            }
            _ => {}
        }

        if state.is_terminal() {
            self.try_settle(pipeline_id);
        }
    }

    /// A task stopped without being asked to: its worker went away.
    fn unexpected_cancel(&self, pipeline_id: PipelineId, location: &TaskLocation) -> EngineError {
        let worker_id = self
            .pipelines
            .get(&pipeline_id)
            .and_then(|rt| rt.slot_workers.get(&location.slot_id).cloned());
        match worker_id {
            Some(worker_id)
                if !self
                    .context
                    .cluster
                    .resource_manager()
                    .workers()
                    .contains(&worker_id) =>
            {
                let slots = self
                    .pipelines
                    .get(&pipeline_id)
                    .map(|rt| rt.slot_workers.values().filter(|w| **w == worker_id).count())
                    .unwrap_or(0);
                EngineError::WorkerLost { worker_id, slots }
            }
            _ => EngineError::TaskExecution {
                task: self.task_name(pipeline_id, location.task_id),
                reason: "canceled unexpectedly".to_string(),
            },
        }
    }

    fn is_canceling(&self, pipeline_id: PipelineId) -> bool {
        self.pipelines
            .get(&pipeline_id)
            .map(|rt| rt.canceling || rt.status == PipelineStatus::Failing)
            .unwrap_or(true)
    }

    fn on_worker_lost(&mut self, lost: LostWorker) {
        let job_id = self.job_id();
        let mut affected: BTreeMap<PipelineId, usize> = BTreeMap::new();
        for owner in lost.lost.iter().filter(|o| o.job_id == job_id) {
            let pipeline = match self.plan.pipeline_mut(owner.pipeline_id) {
                Some(pipeline) => pipeline,
                None => continue,
            };
            let tasks: Vec<TaskId> = pipeline
                .physical_vertices
                .iter()
                .filter_map(|v| v.location.filter(|_| !v.state.is_terminal()))
                .chain(
                    pipeline
                        .coordinator_vertices
                        .iter()
                        .filter_map(|v| v.location.filter(|_| !v.state.is_terminal())),
                )
                .filter(|l| l.task_group_id == owner.task_group_id)
                .map(|l| l.task_id)
                .collect();
            if tasks.is_empty() {
                // an older generation or already done
                continue;
            }
            for task_id in tasks {
                pipeline.set_state(task_id, ExecutionState::Failed);
            }
            *affected.entry(owner.pipeline_id).or_insert(0) += 1;
        }

        for (pipeline_id, slots) in affected {
            if self.is_canceling(pipeline_id) {
                self.try_settle(pipeline_id);
                continue;
            }
            self.pipeline_failed(
                pipeline_id,
                EngineError::WorkerLost {
                    worker_id: lost.worker_id,
                    slots,
                },
            );
        }
    }

    fn pipeline_failed(&mut self, pipeline_id: PipelineId, err: EngineError) {
        let job_id = self.job_id();
        let rt = match self.pipelines.get_mut(&pipeline_id) {
            Some(rt) => rt,
            None => return,
        };
        if rt.status.is_terminal() {
            return;
        }
        if rt.failure.is_none() {
            error!("{}/{} failed. {}", job_id, pipeline_id, err);
            rt.failure = Some(err);
        }
        rt.coordinator.abort("pipeline failing");
        self.set_pipeline_status(pipeline_id, PipelineStatus::Failing);
        self.cancel_pipeline_tasks(pipeline_id);
        self.refresh_status();
        self.try_settle(pipeline_id);
    }

    /// Cancel the deployed tasks, tasks never deployed are canceled right away.
    fn cancel_pipeline_tasks(&mut self, pipeline_id: PipelineId) {
        let (undeployed, deployed) = match self.plan.pipeline(pipeline_id) {
            Some(pipeline) => {
                let tasks = task_states(pipeline);
                let undeployed: Vec<TaskId> = tasks
                    .iter()
                    .filter(|(_, state, location)| {
                        *state == ExecutionState::Created || location.is_none()
                    })
                    .filter(|(_, state, _)| !state.is_terminal())
                    .map(|(task_id, _, _)| *task_id)
                    .collect();
                let deployed: Vec<TaskLocation> = tasks
                    .iter()
                    .filter(|(_, state, _)| {
                        *state == ExecutionState::Deploying || *state == ExecutionState::Running
                    })
                    .filter_map(|(_, _, location)| *location)
                    .collect();
                (undeployed, deployed)
            }
            None => return,
        };

        for task_id in undeployed {
            self.set_task_state(pipeline_id, task_id, ExecutionState::Canceled);
        }
        let router = self.context.cluster.router();
        for location in deployed {
            if let Err(e) = router.route(OperationMessage {
                location,
                op: ControlOp::Cancel,
            }) {
                debug!("cancel of {} not delivered. {}", location, e);
            }
        }
    }

    /// Once every task of a failing or stopping pipeline is terminal: release the slots
    /// and decide on the next pipeline status.
    fn try_settle(&mut self, pipeline_id: PipelineId) {
        let (all_terminal, all_finished) = match self.plan.pipeline(pipeline_id) {
            Some(pipeline) => {
                let states = task_states(pipeline);
                (
                    states.iter().all(|(_, s, _)| s.is_terminal()),
                    states
                        .iter()
                        .all(|(_, s, _)| *s == ExecutionState::Finished),
                )
            }
            None => return,
        };
        if !all_terminal {
            return;
        }
        let (status, failure, canceling) = match self.pipelines.get(&pipeline_id) {
            Some(rt) if rt.restart_at.is_some() => return,
            Some(rt) => (rt.status, rt.failure.clone(), rt.canceling),
            None => return,
        };
        match status {
            PipelineStatus::Running | PipelineStatus::Scheduled | PipelineStatus::Failing => {}
            _ => return,
        }

        self.release(pipeline_id);
        match failure {
            None if all_finished => {
                self.set_pipeline_status(pipeline_id, PipelineStatus::Finished);
                self.schedule_pipelines();
            }
            None => self.set_pipeline_status(pipeline_id, PipelineStatus::Canceled),
            Some(err) => {
                if self.stopping.is_some() || canceling {
                    self.set_pipeline_status(pipeline_id, PipelineStatus::Failed);
                } else if let Some(delay) = self.restart_delay(pipeline_id, &err) {
                    if let Some(rt) = self.pipelines.get_mut(&pipeline_id) {
                        rt.restart_at = Some(Instant::now() + delay);
                        info!(
                            "{}/{} restarts in {:?}, attempt {}",
                            self.job_info.job_id, pipeline_id, delay, rt.attempts
                        );
                    }
                } else {
                    self.set_pipeline_status(pipeline_id, PipelineStatus::Failed);
                    self.stop_job(JobStatus::Failed, Some(err));
                }
            }
        }
        self.refresh_status();
    }

    /// Restart only recoverable failures of checkpointed jobs, as long as the policy
    /// allows another attempt.
    fn restart_delay(&mut self, pipeline_id: PipelineId, err: &EngineError) -> Option<Duration> {
        if !err.is_recoverable() {
            info!("{} is not recoverable", err);
            return None;
        }
        if !self.checkpoint_enabled {
            info!("{} can not restart without checkpoint", pipeline_id);
            return None;
        }
        let rt = self.pipelines.get_mut(&pipeline_id)?;
        rt.attempts += 1;
        let delay = rt.policy.next_delay(rt.attempts);
        if delay.is_none() {
            warn!(
                "{}/{} gives up after {} restarts",
                self.job_info.job_id,
                pipeline_id,
                rt.attempts - 1
            );
        }
        delay
    }

    fn restart_pipeline(&mut self, pipeline_id: PipelineId) {
        let id_generator = self.context.id_generator.clone();
        if let Some(pipeline) = self.plan.pipeline_mut(pipeline_id) {
            pipeline.new_generation(id_generator.as_ref());
        }
        if let Some(rt) = self.pipelines.get_mut(&pipeline_id) {
            rt.restart_at = None;
            rt.failure = None;
            rt.slot_workers.clear();
            rt.coordinator.reset_for_restart();
            rt.restore = rt.coordinator.latest_completed().cloned();
            rt.restarts.fetch_add(1);
            match rt.restore.as_ref() {
                Some(ck) => info!(
                    "restart {}/{} from {}",
                    self.job_info.job_id, pipeline_id, ck.checkpoint_id
                ),
                None => info!(
                    "restart {}/{} from scratch",
                    self.job_info.job_id, pipeline_id
                ),
            }
        }

        match self.deploy_pipeline(pipeline_id) {
            Ok(()) => self.refresh_status(),
            Err(e) => self.pipeline_failed(pipeline_id, e),
        }
    }

    fn release(&mut self, pipeline_id: PipelineId) {
        match self
            .context
            .cluster
            .resource_manager()
            .release_resources(self.job_info.job_id, pipeline_id)
        {
            Ok(n) => debug!("{}/{} released {} slots", self.job_info.job_id, pipeline_id, n),
            Err(e) => error!(
                "release slots of {}/{} error. {}",
                self.job_info.job_id, pipeline_id, e
            ),
        }
    }

    fn stop_job(&mut self, target: JobStatus, err: Option<EngineError>) {
        if self.stopping.is_none() {
            info!("stop {} with {}", self.job_id(), target);
            self.stopping = Some(target);
        }
        if self.error.is_none() {
            self.error = err;
        }

        let pipeline_ids: Vec<PipelineId> = self.pipelines.keys().cloned().collect();
        for pipeline_id in pipeline_ids {
            match self.pipeline_status(pipeline_id) {
                Some(PipelineStatus::Created) | Some(PipelineStatus::Waiting) => {
                    self.set_pipeline_status(pipeline_id, PipelineStatus::Canceled);
                }
                Some(status) if !status.is_terminal() => {
                    if let Some(rt) = self.pipelines.get_mut(&pipeline_id) {
                        rt.canceling = true;
                        rt.restart_at = None;
                        rt.coordinator.abort("job stopping");
                    }
                    self.cancel_pipeline_tasks(pipeline_id);
                    self.try_settle(pipeline_id);
                }
                _ => {}
            }
        }
        self.refresh_status();
    }

    fn start_savepoint(&mut self) {
        if self.savepoint || self.stopping.is_some() {
            return;
        }
        self.savepoint = true;
        let pipeline_ids: Vec<PipelineId> = self.pipelines.keys().cloned().collect();
        for pipeline_id in pipeline_ids {
            match self.pipeline_status(pipeline_id) {
                Some(PipelineStatus::Created) | Some(PipelineStatus::Waiting) => {
                    self.set_pipeline_status(pipeline_id, PipelineStatus::Canceled);
                }
                _ => {}
            }
        }
        self.on_tick(Instant::now());
    }

    fn on_tick(&mut self, now: Instant) {
        let pipeline_ids: Vec<PipelineId> = self.pipelines.keys().cloned().collect();
        for pipeline_id in pipeline_ids {
            let (status, restart_due, canceling, savepoint_pending, periodic_due) =
                match self.pipelines.get_mut(&pipeline_id) {
                    Some(rt) => {
                        if let Some(err) = rt.coordinator.check_timeout(now) {
                            warn!("{}", err);
                        }
                        (
                            rt.status,
                            rt.restart_at.map(|at| at <= now).unwrap_or(false),
                            rt.canceling,
                            !rt.savepoint_done && rt.coordinator.pending_checkpoint_id().is_none(),
                            rt.coordinator.should_trigger(now),
                        )
                    }
                    None => continue,
                };

            if status == PipelineStatus::Failing && restart_due && self.stopping.is_none() {
                self.restart_pipeline(pipeline_id);
                continue;
            }
            if status != PipelineStatus::Running || canceling {
                continue;
            }
            if self.savepoint {
                if savepoint_pending {
                    self.trigger(pipeline_id, CheckpointType::Savepoint);
                }
            } else if periodic_due {
                self.trigger(pipeline_id, CheckpointType::Checkpoint);
            }
        }
    }

    fn trigger(&mut self, pipeline_id: PipelineId, checkpoint_type: CheckpointType) {
        let tasks = match self.plan.pipeline(pipeline_id) {
            Some(pipeline) => pipeline.all_task_ids(),
            None => return,
        };
        let outcome = match self.pipelines.get_mut(&pipeline_id) {
            Some(rt) => rt.coordinator.trigger(checkpoint_type, tasks.as_slice()),
            None => return,
        };
        match outcome {
            TriggerOutcome::Triggered(barrier) => self.inject_barrier(pipeline_id, barrier),
            TriggerOutcome::Completed(ck) => self.on_checkpoint_completed(pipeline_id, ck),
            TriggerOutcome::Rejected(reason) => debug!(
                "{} of {}/{} rejected: {}",
                checkpoint_type, self.job_info.job_id, pipeline_id, reason
            ),
        }
    }

    fn inject_barrier(&self, pipeline_id: PipelineId, barrier: CheckpointBarrier) {
        let targets = match self.plan.pipeline(pipeline_id) {
            Some(pipeline) => barrier_targets(pipeline, &self.job_info.logical_dag),
            None => return,
        };
        let router = self.context.cluster.router();
        let op = ControlOp::CheckpointBarrier(barrier);
        for (location, fallback) in targets {
            let delivered = router.route(OperationMessage {
                location,
                op: op.clone(),
            });
            if let Err(e) = delivered {
                debug!("{} not delivered to {}. {}", barrier.checkpoint_id, location, e);
                // the enumerator just ended, its readers take the barrier directly
                for reader in fallback {
                    if let Err(e) = router.route(OperationMessage {
                        location: reader,
                        op: op.clone(),
                    }) {
                        debug!("{} not delivered to {}. {}", barrier.checkpoint_id, reader, e);
                    }
                }
            }
        }
    }

    fn on_checkpoint_result(
        &mut self,
        pipeline_id: PipelineId,
        result: Result<Option<CompletedCheckpoint>, EngineError>,
    ) {
        match result {
            Ok(Some(ck)) => self.on_checkpoint_completed(pipeline_id, ck),
            Ok(None) => {}
            Err(e) => warn!("{}/{} checkpoint error. {}", self.job_info.job_id, pipeline_id, e),
        }
    }

    fn on_checkpoint_completed(&mut self, pipeline_id: PipelineId, ck: CompletedCheckpoint) {
        self.view
            .latest_checkpoints
            .insert(pipeline_id, ck.checkpoint_id);

        let live: Vec<TaskLocation> = match self.plan.pipeline(pipeline_id) {
            Some(pipeline) => task_states(pipeline)
                .into_iter()
                .filter(|(_, state, _)| !state.is_terminal())
                .filter_map(|(_, _, location)| location)
                .collect(),
            None => return,
        };
        let router = self.context.cluster.router();
        for location in live {
            if let Err(e) = router.route(OperationMessage {
                location,
                op: ControlOp::NotifyCheckpointComplete(ck.checkpoint_id),
            }) {
                debug!("notify {} not delivered to {}. {}", ck.checkpoint_id, location, e);
            }
        }

        if ck.checkpoint_type == CheckpointType::Savepoint {
            info!(
                "savepoint {} of {}/{} completed",
                ck.checkpoint_id, self.job_info.job_id, pipeline_id
            );
            if let Some(rt) = self.pipelines.get_mut(&pipeline_id) {
                rt.savepoint_done = true;
                rt.canceling = true;
            }
            self.cancel_pipeline_tasks(pipeline_id);
            self.try_settle(pipeline_id);
        }
    }

    fn cleanup(&mut self) {
        let pipeline_ids: Vec<PipelineId> = self.pipelines.keys().cloned().collect();
        for pipeline_id in pipeline_ids {
            self.release(pipeline_id);
        }
        self.context.cluster.store().drop_job(self.job_info.job_id);
        unregister(&Tag::new("job_id", self.job_info.job_id.0));
    }
}

/// `(task, state, location)` of every task of the current generation.
fn task_states(pipeline: &Pipeline) -> Vec<(TaskId, ExecutionState, Option<TaskLocation>)> {
    pipeline
        .coordinator_vertices
        .iter()
        .map(|v| (v.task_id, v.state, v.location))
        .chain(
            pipeline
                .physical_vertices
                .iter()
                .map(|v| (v.task_id, v.state, v.location)),
        )
        .collect()
}

/// Where a barrier enters the pipeline: the split enumerator of a coordinated source
/// (with its readers as fallback), every reader of a parallel source and every task
/// reading an intermediate dataset. The rest gets the barrier through the data channels.
fn barrier_targets(pipeline: &Pipeline, dag: &LogicalDag) -> Vec<(TaskLocation, Vec<TaskLocation>)> {
    let mut targets = Vec::new();
    for vertex_id in &pipeline.vertex_ids {
        let is_source = dag
            .vertex(*vertex_id)
            .map(|v| v.action.is_source())
            .unwrap_or(false);
        let reads_intermediate = pipeline
            .upstream
            .iter()
            .any(|e| e.edge.target_vertex_id == *vertex_id);
        if !is_source && !reads_intermediate {
            continue;
        }

        let mut readers: Vec<(u32, TaskLocation)> = pipeline
            .physical_vertices_of(*vertex_id)
            .into_iter()
            .filter(|v| !v.state.is_terminal())
            .filter_map(|v| v.location.map(|l| (v.subtask_index, l)))
            .collect();
        readers.sort_by_key(|(subtask_index, _)| *subtask_index);
        let readers: Vec<TaskLocation> = readers.into_iter().map(|(_, l)| l).collect();

        let enumerator = pipeline
            .coordinator_vertices
            .iter()
            .find(|c| c.vertex_id == *vertex_id && !c.state.is_terminal())
            .and_then(|c| c.location);
        match enumerator {
            Some(location) => targets.push((location, readers)),
            None => targets.extend(readers.into_iter().map(|r| (r, Vec::new()))),
        }
    }
    targets
}

fn build_deployments(
    job_id: JobId,
    dag: &LogicalDag,
    pipeline: &Pipeline,
    allocations: &HashMap<TaskGroupId, SlotAllocation>,
    restore: Option<&CompletedCheckpoint>,
) -> Result<Vec<(WorkerId, TaskGroupDeployment)>, EngineError> {
    let restored_checkpoint_id = restore.map(|ck| ck.checkpoint_id).unwrap_or_default();
    let restored_state = |key: StateKey| restore.and_then(|ck| ck.state_of(&key)).map(|s| s.to_vec());
    let missing = |what: String| EngineError::Internal(format!("{} missing in plan", what));

    let mut deployments = Vec::with_capacity(pipeline.task_groups.len());
    for group in &pipeline.task_groups {
        let allocation = allocations
            .get(&group.task_group_id)
            .ok_or_else(|| missing(group.task_group_id.to_string()))?;
        let mut tasks = Vec::with_capacity(group.task_ids.len());
        let mut local_edges = Vec::new();

        match group.subtask_index {
            Some(subtask_index) => {
                let task_of = |vertex_id: VertexId| {
                    pipeline
                        .physical_vertices
                        .iter()
                        .find(|v| v.vertex_id == vertex_id && v.subtask_index == subtask_index)
                        .ok_or_else(|| missing(format!("{}#{}", vertex_id, subtask_index)))
                };

                for vertex_id in &pipeline.vertex_ids {
                    let physical = task_of(*vertex_id)?;
                    let vertex = dag
                        .vertex(*vertex_id)
                        .ok_or_else(|| missing(vertex_id.to_string()))?;
                    let role = match &vertex.action {
                        Action::Source(_) => TaskRole::SourceReader {
                            coordinated: pipeline.coordinated_vertex_ids.contains(vertex_id),
                        },
                        Action::Transform(_) => TaskRole::Transform,
                        Action::Sink(_) => TaskRole::Sink,
                    };
                    let intermediate_inputs = pipeline
                        .upstream
                        .iter()
                        .filter(|e| e.edge.target_vertex_id == *vertex_id)
                        .map(|e| IntermediateInput {
                            dataset: e.dataset_id(job_id),
                            partition: subtask_index,
                        })
                        .collect();
                    let intermediate_outputs = pipeline
                        .downstream
                        .iter()
                        .filter(|e| e.edge.input_vertex_id == *vertex_id)
                        .map(|e| IntermediateOutput {
                            dataset: e.dataset_id(job_id),
                            partitions: e.partitions,
                            partitioner: e.partitioner.clone(),
                            blocking: e.blocking,
                        })
                        .collect();

                    tasks.push(TaskDeployment {
                        task_id: physical.task_id,
                        vertex_id: *vertex_id,
                        subtask_index,
                        parallelism: physical.parallelism,
                        state_key: physical.state_key(),
                        action: vertex.action.clone(),
                        role,
                        restored_state: restored_state(physical.state_key()),
                        intermediate_inputs,
                        intermediate_outputs,
                    });
                }

                for edge in &pipeline.internal_edges {
                    local_edges.push(LocalEdge {
                        from: task_of(edge.input_vertex_id)?.task_id,
                        to: task_of(edge.target_vertex_id)?.task_id,
                    });
                }
            }
            None => {
                for task_id in &group.task_ids {
                    let coordinator = pipeline
                        .coordinator_vertex(*task_id)
                        .ok_or_else(|| missing(task_id.to_string()))?;
                    let vertex = dag
                        .vertex(coordinator.vertex_id)
                        .ok_or_else(|| missing(coordinator.vertex_id.to_string()))?;

                    let mut readers = pipeline.physical_vertices_of(coordinator.vertex_id);
                    readers.sort_by_key(|v| v.subtask_index);
                    let readers = readers
                        .iter()
                        .map(|v| v.location.ok_or_else(|| missing(v.task_id.to_string())))
                        .collect::<Result<Vec<TaskLocation>, EngineError>>()?;

                    tasks.push(TaskDeployment {
                        task_id: *task_id,
                        vertex_id: coordinator.vertex_id,
                        subtask_index: 0,
                        parallelism: readers.len() as u32,
                        state_key: coordinator.state_key(),
                        action: vertex.action.clone(),
                        role: TaskRole::SplitEnumerator { readers },
                        restored_state: restored_state(coordinator.state_key()),
                        intermediate_inputs: Vec::new(),
                        intermediate_outputs: Vec::new(),
                    });
                }
            }
        }

        deployments.push((
            allocation.worker_id,
            TaskGroupDeployment {
                job_id,
                pipeline_id: pipeline.pipeline_id,
                task_group_id: group.task_group_id,
                slot_id: allocation.slot_id,
                tasks,
                local_edges,
                restored_checkpoint_id,
            },
        ));
    }
    Ok(deployments)
}
