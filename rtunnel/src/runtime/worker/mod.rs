//! Worker side execution: one [`TaskExecutionService`] per worker runs the task groups
//! deployed to its slots, one thread per task.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::api::action::Action;
use crate::api::cluster::PollPolicy;
use crate::api::connector::SubtaskContext;
use crate::api::error::EngineError;
use crate::api::factory::ConnectorRegistry;
use crate::api::runtime::{SlotId, TaskGroupLocation, TaskId, TaskLocation, WorkerId};
use crate::channel::{named_channel, unbounded, ElementReceiver, ElementSender, Sender};
use crate::metrics::metric::{unregister, Gauge};
use crate::metrics::{register_counter, register_gauge, Tag};
use crate::runtime::intermediate::IntermediateStore;
use crate::runtime::wire::{
    decode, ControlOp, MessageKind, OperationMessage, TaskDeployment, TaskGroupDeployment,
    TaskRole,
};
use crate::runtime::worker::enumerator_task::SplitEnumeratorTask;
use crate::runtime::worker::io::{IntermediateReader, Output};
use crate::runtime::worker::operator_task::{Inputs, Operator, OperatorTask};
use crate::runtime::worker::source_task::SourceReaderTask;
use crate::runtime::worker::task::{
    execute, Outcome, Task, TaskContext, TaskReporter, TaskSnapshot,
};
use crate::runtime::ExecutionState;
use crate::utils::panic::panic_message;
use crate::utils::thread::{join_thread, reap_finished, spawn};

pub mod aligner;
pub mod enumerator_task;
pub mod heart_beat;
pub mod io;
pub mod operator_task;
pub mod source_task;
pub mod task;

/// Delivers a control operation to the worker hosting `message.location`.
pub trait OperationRouter: Send + Sync {
    fn route(&self, message: OperationMessage) -> Result<(), EngineError>;
}

struct TaskHandle {
    group: TaskGroupLocation,
    location: TaskLocation,
    ops: Sender<ControlOp>,
    running: Arc<AtomicBool>,
}

struct GroupState {
    slot_id: SlotId,
    remaining: usize,
}

/// Shared between the service and its task threads.
struct ServiceState {
    worker_id: WorkerId,
    tasks: DashMap<TaskId, TaskHandle>,
    slots: DashMap<SlotId, TaskGroupLocation>,
    groups: DashMap<TaskGroupLocation, GroupState>,
    running_tasks: Gauge,
}

impl ServiceState {
    fn deregister(&self, task_id: TaskId) {
        self.tasks.remove(&task_id);
    }

    /// The slot is free again once the last task of its group left.
    fn task_exited(&self, group: TaskGroupLocation) {
        self.running_tasks.fetch_sub(1);
        let released = match self.groups.get_mut(&group) {
            Some(mut state) => {
                state.remaining = state.remaining.saturating_sub(1);
                if state.remaining == 0 {
                    Some(state.slot_id)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(slot_id) = released {
            self.groups.remove(&group);
            self.slots.remove(&slot_id);
            debug!("{} leaves {} of {}", group, slot_id, self.worker_id);
        }
    }
}

pub struct TaskExecutionService {
    state: Arc<ServiceState>,
    registry: Arc<ConnectorRegistry>,
    store: Arc<IntermediateStore>,
    router: Arc<dyn OperationRouter>,
    poll_policy: PollPolicy,
    channel_capacity: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskExecutionService {
    pub fn new(
        worker_id: WorkerId,
        registry: Arc<ConnectorRegistry>,
        store: Arc<IntermediateStore>,
        router: Arc<dyn OperationRouter>,
        poll_policy: PollPolicy,
        channel_capacity: usize,
    ) -> Self {
        let running_tasks = register_gauge("running_tasks", vec![Tag::new("worker_id", worker_id.0)]);
        TaskExecutionService {
            state: Arc::new(ServiceState {
                worker_id,
                tasks: DashMap::new(),
                slots: DashMap::new(),
                groups: DashMap::new(),
                running_tasks,
            }),
            registry,
            store,
            router,
            poll_policy,
            channel_capacity,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.state.worker_id
    }

    pub fn running_task_count(&self) -> usize {
        self.state.tasks.len()
    }

    pub fn is_slot_occupied(&self, slot_id: SlotId) -> bool {
        self.state.slots.contains_key(&slot_id)
    }

    /// Start every task of a serialized [`TaskGroupDeployment`]. Task events are reported
    /// through `reporter` as serialized [`crate::runtime::wire::TaskEvent`]s.
    pub fn deploy_task(&self, bytes: &[u8], reporter: Sender<Vec<u8>>) -> Result<(), EngineError> {
        let deployment: TaskGroupDeployment = decode(MessageKind::TaskGroupDeployment, bytes)?;
        let group = deployment.location();

        match self.state.slots.entry(deployment.slot_id) {
            Entry::Occupied(e) => {
                return Err(EngineError::Internal(format!(
                    "{} of {} is occupied by {}, refuse {}",
                    deployment.slot_id,
                    self.state.worker_id,
                    e.get(),
                    group
                )));
            }
            Entry::Vacant(e) => {
                e.insert(group);
            }
        }
        self.state.groups.insert(
            group,
            GroupState {
                slot_id: deployment.slot_id,
                remaining: deployment.tasks.len(),
            },
        );

        let mut inputs: HashMap<TaskId, Vec<ElementReceiver>> = HashMap::new();
        let mut outputs: HashMap<TaskId, Vec<ElementSender>> = HashMap::new();
        for edge in &deployment.local_edges {
            let (sender, receiver) = named_channel(
                format!("{}_{}", edge.from, edge.to).as_str(),
                vec![
                    Tag::new("job_id", group.job_id.0),
                    Tag::new("task_id", edge.from.0),
                ],
                self.channel_capacity,
            );
            outputs.entry(edge.from).or_default().push(sender);
            inputs.entry(edge.to).or_default().push(receiver);
        }

        // register all tasks of the group before starting any, routed operations between
        // members of the group must find their target
        let mut prepared = Vec::new();
        for task in deployment.tasks.iter() {
            let (ops, op_receiver) = unbounded();
            let running = Arc::new(AtomicBool::new(true));
            let location = deployment.task_location(task.task_id);
            self.state.tasks.insert(
                task.task_id,
                TaskHandle {
                    group,
                    location,
                    ops,
                    running: running.clone(),
                },
            );
            self.state.running_tasks.fetch_add(1);
            prepared.push((task.clone(), op_receiver, running));
        }

        info!(
            "deploy {} with {} tasks to {} of {}",
            group,
            prepared.len(),
            deployment.slot_id,
            self.state.worker_id
        );
        for (task, op_receiver, running) in prepared {
            let task_id = task.task_id;
            let reporter = TaskReporter::new(
                group.job_id,
                group.pipeline_id,
                deployment.task_location(task_id),
                task.state_key,
                reporter.clone(),
            );
            let ctx = TaskContext {
                job_id: group.job_id,
                pipeline_id: group.pipeline_id,
                location: deployment.task_location(task_id),
                vertex_id: task.vertex_id,
                subtask_index: task.subtask_index,
                parallelism: task.parallelism,
                task_name: format!("{}-{}", task.action.name(), task.subtask_index),
                running: running.clone(),
                reporter,
                poll_policy: self.poll_policy.clone(),
                ops: op_receiver,
                last_checkpoint_id: deployment.restored_checkpoint_id,
            };
            let runner = TaskRunner {
                deployment: task,
                inputs: inputs.remove(&task_id).unwrap_or_default(),
                outputs: outputs.remove(&task_id).unwrap_or_default(),
                registry: self.registry.clone(),
                store: self.store.clone(),
                router: self.router.clone(),
                state: self.state.clone(),
                group,
            };

            let thread_name = format!(
                "Task-{}-{}-{}-{}",
                group.job_id.0, group.pipeline_id.0, group.task_group_id.0, task_id.0
            );
            match spawn(thread_name.as_str(), move || runner.run(ctx)) {
                Ok(handle) => {
                    let mut threads = lock!(self.threads, "task threads")?;
                    reap_finished(&mut threads);
                    threads.push(handle);
                }
                Err(e) => {
                    running.store(false, Ordering::SeqCst);
                    self.state.deregister(task_id);
                    self.state.task_exited(group);
                    return Err(EngineError::from(e));
                }
            }
        }
        Ok(())
    }

    /// Ask a task to stop. Returns `false` when the task is not running here.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        match self.state.tasks.get(&task_id) {
            Some(handle) => {
                handle.running.store(false, Ordering::SeqCst);
                let _ = handle.ops.send(ControlOp::Cancel);
                true
            }
            None => false,
        }
    }

    /// Queue a serialized [`OperationMessage`] for its target task.
    pub fn deliver_operation(&self, bytes: &[u8]) -> Result<(), EngineError> {
        let message: OperationMessage = decode(MessageKind::Operation, bytes)?;
        let handle = self.state.tasks.get(&message.location.task_id).ok_or_else(|| {
            EngineError::Internal(format!(
                "{} is not running on {}",
                message.location, self.state.worker_id
            ))
        })?;
        if handle.location != message.location {
            return Err(EngineError::Internal(format!(
                "{} is deployed at {}, not {}",
                message.location.task_id, handle.location, message.location
            )));
        }
        if message.op == ControlOp::Cancel {
            handle.running.store(false, Ordering::SeqCst);
        }
        handle.ops.send(message.op).map_err(|_| {
            EngineError::Internal(format!("{} stopped taking operations", message.location))
        })
    }

    /// Cancel every task and wait for the task threads.
    pub fn shutdown(&self) {
        let groups: Vec<TaskGroupLocation> = self.state.tasks.iter().map(|h| h.group).collect();
        let task_ids: Vec<TaskId> = self.state.tasks.iter().map(|h| *h.key()).collect();
        for task_id in task_ids {
            self.cancel_task(task_id);
        }

        let threads = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        info!(
            "shutdown {}, waiting for {} task threads of {} groups",
            self.state.worker_id,
            threads.len(),
            groups.len()
        );
        for thread in threads {
            join_thread(thread);
        }
    }
}

/// Everything a task thread needs to build and run its task.
struct TaskRunner {
    deployment: TaskDeployment,
    inputs: Vec<ElementReceiver>,
    outputs: Vec<ElementSender>,
    registry: Arc<ConnectorRegistry>,
    store: Arc<IntermediateStore>,
    router: Arc<dyn OperationRouter>,
    state: Arc<ServiceState>,
    group: TaskGroupLocation,
}

impl TaskRunner {
    fn run(mut self, mut ctx: TaskContext) {
        let task_id = self.deployment.task_id;
        let state = self.state.clone();
        let deregister = move || state.deregister(task_id);

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<Outcome> {
            let mut task = self.build(&ctx)?;
            let outcome = execute(task.as_mut(), &mut ctx, &deregister);
            let closed = task.close();
            let outcome = outcome?;
            closed?;
            Ok(outcome)
        }));

        self.state.deregister(task_id);
        self.state.task_exited(self.group);
        unregister(&Tag::new("task_id", task_id.0));

        let (state, error, final_state) = match outcome {
            Ok(Ok(Outcome::Finished(final_state))) => {
                (ExecutionState::Finished, None, Some(final_state))
            }
            Ok(Ok(Outcome::Canceled)) => (ExecutionState::Canceled, None, None),
            // output channels give up once the task is stopped
            Ok(Err(e)) if !ctx.is_running() => {
                debug!("{} stopped with {:#}", ctx.task_name, e);
                (ExecutionState::Canceled, None, None)
            }
            Ok(Err(e)) =>(ExecutionState::Failed, Some(format!("{:#}", e)), None),
            Err(panic) => (
                ExecutionState::Failed,
                Some(format!("panicked: {}", panic_message(&panic))),
                None,
            ),
        };
        match error.as_ref() {
            Some(e) => error!("{} failed. {}", ctx.task_name, e),
            None => info!("{} {}", ctx.task_name, state),
        }
        ctx.reporter.state_changed(state, error, final_state);
    }

    fn build(&mut self, ctx: &TaskContext) -> anyhow::Result<Box<dyn Task>> {
        let task = self.deployment.clone();
        let local_inputs = std::mem::take(&mut self.inputs);
        let restored = match task.restored_state.as_ref() {
            Some(bytes) => TaskSnapshot::decode(bytes.as_slice())?,
            None => TaskSnapshot::default(),
        };
        let subtask_context = SubtaskContext {
            job_id: ctx.job_id,
            vertex_id: task.vertex_id,
            subtask_index: task.subtask_index,
            parallelism: task.parallelism,
        };
        let tags = vec![
            Tag::new("job_id", ctx.job_id.0),
            Tag::new("task_id", task.task_id.0),
        ];
        let output = Output::new(
            task.subtask_index,
            std::mem::take(&mut self.outputs),
            task.intermediate_outputs.clone(),
            self.store.clone(),
            ctx.running.clone(),
            register_counter("task_rows_out", tags.clone()),
        );

        let built: Box<dyn Task> = match (&task.role, &task.action) {
            (TaskRole::SourceReader { coordinated }, Action::Source(action)) => {
                let source = self
                    .registry
                    .create_source(action.plugin_name.as_str(), &action.properties)?;
                let reader = source.create_reader(&subtask_context)?;
                let enumerator = if *coordinated {
                    None
                } else {
                    Some(source.create_split_enumerator(&subtask_context)?)
                };
                Box::new(SourceReaderTask::new(reader, enumerator, output, restored))
            }
            (TaskRole::SplitEnumerator { readers }, Action::Source(action)) => {
                let source = self
                    .registry
                    .create_source(action.plugin_name.as_str(), &action.properties)?;
                let enumerator = source.create_split_enumerator(&SubtaskContext {
                    subtask_index: 0,
                    parallelism: readers.len() as u32,
                    ..subtask_context
                })?;
                Box::new(SplitEnumeratorTask::new(
                    enumerator,
                    readers.clone(),
                    self.router.clone(),
                    restored,
                ))
            }
            (TaskRole::Transform, Action::Transform(action)) => {
                let transform = self
                    .registry
                    .create_transform(action.plugin_name.as_str(), &action.properties)?;
                Box::new(OperatorTask::new(
                    Operator::Transform(transform),
                    self.inputs(&task, local_inputs),
                    output,
                    restored,
                    register_counter("task_rows_in", tags),
                ))
            }
            (TaskRole::Sink, Action::Sink(action)) => {
                let sink = self
                    .registry
                    .create_sink(action.plugin_name.as_str(), &action.properties)?;
                let writer = sink.create_writer(&subtask_context)?;
                Box::new(OperatorTask::new(
                    Operator::sink(writer),
                    self.inputs(&task, local_inputs),
                    output,
                    restored,
                    register_counter("task_rows_in", tags),
                ))
            }
            (role, action) => {
                return Err(anyhow!(
                    "role {:?} does not match action `{}`",
                    role,
                    action.name()
                ))
            }
        };
        Ok(built)
    }

    fn inputs(&self, task: &TaskDeployment, local_inputs: Vec<ElementReceiver>) -> Inputs {
        if task.intermediate_inputs.is_empty() {
            Inputs::local(local_inputs)
        } else {
            Inputs::Intermediate {
                readers: task
                    .intermediate_inputs
                    .iter()
                    .map(|input| IntermediateReader::new(input.clone()))
                    .collect(),
                store: self.store.clone(),
            }
        }
    }
}
