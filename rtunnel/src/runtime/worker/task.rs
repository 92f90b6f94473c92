//! Poll loop shared by every task role.
//!
//! Control operations are drained before each poll, strictly in arrival order. The poll
//! result picks the backoff: none after a busy poll, the idle backoff (woken early by an
//! incoming operation) after an empty one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::api::checkpoint::StateKey;
use crate::api::cluster::PollPolicy;
use crate::api::runtime::{CheckpointId, JobId, PipelineId, TaskLocation, VertexId};
use crate::channel::{Receiver, RecvTimeoutError, Sender};
use crate::runtime::intermediate::DatasetId;
use crate::runtime::wire::{ControlOp, TaskAcknowledge, TaskEvent};
use crate::runtime::ExecutionState;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Progress {
    /// produced or consumed something, poll again right away
    Busy,
    /// nothing to do, back off
    Idle,
    /// the poll itself blocked for a while, no extra backoff
    Waited,
    End,
}

#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub(crate) struct InputOffset {
    pub dataset: DatasetId,
    pub partition: u32,
    pub offset: u64,
}

#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub(crate) struct OutputWritten {
    pub dataset: DatasetId,
    pub written: u64,
}

/// State blob of one task as stored in a checkpoint.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq)]
pub(crate) struct TaskSnapshot {
    #[serde(default)]
    pub connector: Option<Vec<u8>>,
    /// private enumerator of a parallel source reader
    #[serde(default)]
    pub enumerator: Option<Vec<u8>>,
    #[serde(default)]
    pub input_offsets: Vec<InputOffset>,
    #[serde(default)]
    pub output_written: Vec<OutputWritten>,
}

impl TaskSnapshot {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow!("encode task snapshot error. {}", e))
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow!("decode task snapshot error. {}", e))
    }

    /// Offsets and written counts of another job's datasets do not apply.
    pub fn restore_offset(&self, job_id: JobId, dataset: &DatasetId, partition: u32) -> u64 {
        if dataset.job_id != job_id {
            return 0;
        }
        self.input_offsets
            .iter()
            .find(|x| x.dataset.eq(dataset) && x.partition == partition)
            .map(|x| x.offset)
            .unwrap_or(0)
    }

    pub fn restore_written(&self, job_id: JobId, dataset: &DatasetId) -> u64 {
        if dataset.job_id != job_id {
            return 0;
        }
        self.output_written
            .iter()
            .find(|x| x.dataset.eq(dataset))
            .map(|x| x.written)
            .unwrap_or(0)
    }
}

/// Sends [`TaskEvent`]s of one task to its job master.
#[derive(Clone)]
pub(crate) struct TaskReporter {
    job_id: JobId,
    pipeline_id: PipelineId,
    location: TaskLocation,
    state_key: StateKey,
    sender: Sender<Vec<u8>>,
}

impl TaskReporter {
    pub fn new(
        job_id: JobId,
        pipeline_id: PipelineId,
        location: TaskLocation,
        state_key: StateKey,
        sender: Sender<Vec<u8>>,
    ) -> Self {
        TaskReporter {
            job_id,
            pipeline_id,
            location,
            state_key,
            sender,
        }
    }

    fn send(&self, event: TaskEvent) {
        match event.encode() {
            Ok(bytes) => {
                if self.sender.send(bytes).is_err() {
                    warn!(
                        "job master of {} is gone, drop event of {}",
                        self.job_id, self.location
                    );
                }
            }
            Err(e) => error!("encode event of {} error. {}", self.location, e),
        }
    }

    pub fn state_changed(
        &self,
        state: ExecutionState,
        error: Option<String>,
        final_state: Option<Vec<u8>>,
    ) {
        self.send(TaskEvent::StateChanged {
            job_id: self.job_id,
            pipeline_id: self.pipeline_id,
            task: self.location,
            state,
            error,
            final_state: final_state.map(|s| (self.state_key, s)),
        });
    }

    pub fn acknowledge(&self, checkpoint_id: CheckpointId, state: Vec<u8>) {
        self.send(TaskEvent::CheckpointAck(TaskAcknowledge {
            job_id: self.job_id,
            pipeline_id: self.pipeline_id,
            checkpoint_id,
            task: self.location,
            state_key: self.state_key,
            state,
        }));
    }

    pub fn decline(&self, checkpoint_id: CheckpointId, reason: String) {
        self.send(TaskEvent::CheckpointDecline {
            job_id: self.job_id,
            pipeline_id: self.pipeline_id,
            checkpoint_id,
            task: self.location,
            reason,
        });
    }
}

pub(crate) struct TaskContext {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub location: TaskLocation,
    pub vertex_id: VertexId,
    pub subtask_index: u32,
    pub parallelism: u32,
    /// `{vertex name}-{subtask}`, for logs
    pub task_name: String,
    pub running: Arc<AtomicBool>,
    pub reporter: TaskReporter,
    pub poll_policy: PollPolicy,
    pub ops: Receiver<ControlOp>,
    /// latest barrier this task took part in
    pub last_checkpoint_id: CheckpointId,
}

impl TaskContext {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Snapshot result of a barrier goes to the job master as an ack, or as a decline
    /// that aborts the checkpoint while the task keeps running.
    pub fn report_snapshot(
        &mut self,
        checkpoint_id: CheckpointId,
        snapshot: anyhow::Result<TaskSnapshot>,
    ) {
        self.last_checkpoint_id = checkpoint_id;
        match snapshot.and_then(|s| s.encode()) {
            Ok(state) => self.reporter.acknowledge(checkpoint_id, state),
            Err(e) => {
                warn!("{} snapshot {} error. {:#}", self.task_name, checkpoint_id, e);
                self.reporter.decline(checkpoint_id, format!("{:#}", e));
            }
        }
    }
}

pub(crate) trait Task: Send {
    fn open(&mut self, ctx: &mut TaskContext) -> anyhow::Result<()>;

    fn poll(&mut self, ctx: &mut TaskContext) -> anyhow::Result<Progress>;

    /// `finished` is set for operations that raced with the task's end; the task has
    /// already emitted its end marker then.
    fn handle_op(
        &mut self,
        ctx: &mut TaskContext,
        op: ControlOp,
        finished: bool,
    ) -> anyhow::Result<()>;

    fn snapshot(&mut self, ctx: &TaskContext, checkpoint_id: CheckpointId)
        -> anyhow::Result<TaskSnapshot>;

    fn close(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, PartialEq)]
pub(crate) enum Outcome {
    /// clean end with the final snapshot
    Finished(Vec<u8>),
    Canceled,
}

/// Run `task` until it ends, fails or gets cancelled. `deregister` stops the routing of
/// new operations to the task; it is invoked once the task reached its end, before the
/// operations still queued are drained.
pub(crate) fn execute(
    task: &mut dyn Task,
    ctx: &mut TaskContext,
    deregister: &dyn Fn(),
) -> anyhow::Result<Outcome> {
    task.open(ctx)?;
    ctx.reporter
        .state_changed(ExecutionState::Running, None, None);
    info!("{} running at {}", ctx.task_name, ctx.location);

    loop {
        while let Ok(op) = ctx.ops.try_recv() {
            match op {
                ControlOp::Cancel => return Ok(Outcome::Canceled),
                op => task.handle_op(ctx, op, false)?,
            }
        }
        if !ctx.is_running() {
            return Ok(Outcome::Canceled);
        }

        match task.poll(ctx)? {
            Progress::Busy => {
                let busy_yield = ctx.poll_policy.busy_yield();
                if busy_yield > Duration::ZERO {
                    std::thread::sleep(busy_yield);
                } else {
                    std::thread::yield_now();
                }
            }
            Progress::Idle => match ctx.ops.recv_timeout(ctx.poll_policy.idle_backoff()) {
                Ok(ControlOp::Cancel) => return Ok(Outcome::Canceled),
                Ok(op) => task.handle_op(ctx, op, false)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(ctx.poll_policy.idle_backoff())
                }
            },
            Progress::Waited => {}
            Progress::End => break,
        }
    }

    let final_state = task.snapshot(ctx, ctx.last_checkpoint_id)?.encode()?;
    deregister();
    while let Ok(op) = ctx.ops.try_recv() {
        if op != ControlOp::Cancel {
            task.handle_op(ctx, op, true)?;
        }
    }
    Ok(Outcome::Finished(final_state))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use crate::api::checkpoint::StateKey;
    use crate::api::cluster::PollPolicy;
    use crate::api::runtime::{
        CheckpointId, JobId, PipelineId, SlotId, TaskGroupId, TaskId, TaskLocation, VertexId,
    };
    use crate::channel::{unbounded, Receiver, Sender};
    use crate::runtime::intermediate::DatasetId;
    use crate::runtime::wire::{ControlOp, TaskEvent};
    use crate::runtime::worker::task::{
        execute, InputOffset, Outcome, Progress, Task, TaskContext, TaskReporter, TaskSnapshot,
    };
    use crate::runtime::ExecutionState;

    pub(crate) struct TestContext {
        pub ctx: TaskContext,
        pub ops: Sender<ControlOp>,
        pub events: Receiver<Vec<u8>>,
    }

    impl TestContext {
        pub fn drain_events(&self) -> Vec<TaskEvent> {
            let mut events = Vec::new();
            while let Ok(bytes) = self.events.try_recv() {
                events.push(TaskEvent::decode(bytes.as_slice()).unwrap());
            }
            events
        }
    }

    pub(crate) fn test_context(subtask_index: u32, parallelism: u32) -> TestContext {
        let (ops, ops_receiver) = unbounded();
        let (event_sender, events) = unbounded();
        let location = TaskLocation::new(SlotId(1), TaskGroupId(1), TaskId(100 + subtask_index as u64));
        let state_key = StateKey::Task {
            vertex_id: VertexId(1),
            subtask_index,
        };
        let ctx = TaskContext {
            job_id: JobId(1),
            pipeline_id: PipelineId(1),
            location,
            vertex_id: VertexId(1),
            subtask_index,
            parallelism,
            task_name: format!("test-{}", subtask_index),
            running: Arc::new(AtomicBool::new(true)),
            reporter: TaskReporter::new(JobId(1), PipelineId(1), location, state_key, event_sender),
            poll_policy: PollPolicy {
                idle_backoff_ms: 5,
                busy_yield_ms: 0,
            },
            ops: ops_receiver,
            last_checkpoint_id: CheckpointId::default(),
        };
        TestContext { ctx, ops, events }
    }

    /// Counts to `limit`, one number per poll.
    struct CountTask {
        value: u64,
        limit: u64,
        ops_seen: Vec<ControlOp>,
    }

    impl Task for CountTask {
        fn open(&mut self, _ctx: &mut TaskContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn poll(&mut self, _ctx: &mut TaskContext) -> anyhow::Result<Progress> {
            if self.value >= self.limit {
                return Ok(Progress::End);
            }
            self.value += 1;
            Ok(Progress::Busy)
        }

        fn handle_op(
            &mut self,
            _ctx: &mut TaskContext,
            op: ControlOp,
            _finished: bool,
        ) -> anyhow::Result<()> {
            self.ops_seen.push(op);
            Ok(())
        }

        fn snapshot(
            &mut self,
            _ctx: &TaskContext,
            _checkpoint_id: CheckpointId,
        ) -> anyhow::Result<TaskSnapshot> {
            Ok(TaskSnapshot {
                connector: Some(self.value.to_string().into_bytes()),
                ..Default::default()
            })
        }

        fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    pub fn execute_until_end_test() {
        let mut tc = test_context(0, 1);
        let mut task = CountTask {
            value: 0,
            limit: 5,
            ops_seen: vec![],
        };
        tc.ops.send(ControlOp::NoMoreSplits).unwrap();
        let outcome = execute(&mut task, &mut tc.ctx, &|| {}).unwrap();

        let snapshot = match outcome {
            Outcome::Finished(state) => TaskSnapshot::decode(state.as_slice()).unwrap(),
            o => panic!("unexpected {:?}", o),
        };
        assert_eq!(snapshot.connector, Some(b"5".to_vec()));
        assert_eq!(task.ops_seen, vec![ControlOp::NoMoreSplits]);

        let events = tc.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TaskEvent::StateChanged { state, .. } => assert_eq!(*state, ExecutionState::Running),
            e => panic!("unexpected {:?}", e),
        }
    }

    #[test]
    pub fn cancel_before_end_test() {
        let mut tc = test_context(0, 1);
        let mut task = CountTask {
            value: 0,
            limit: u64::MAX,
            ops_seen: vec![],
        };
        tc.ops.send(ControlOp::Cancel).unwrap();
        assert_eq!(
            execute(&mut task, &mut tc.ctx, &|| {}).unwrap(),
            Outcome::Canceled
        );
    }

    #[test]
    pub fn snapshot_restore_scope_test() {
        let dataset = DatasetId {
            job_id: JobId(1),
            input_vertex_id: VertexId(1),
            target_vertex_id: VertexId(2),
        };
        let snapshot = TaskSnapshot {
            input_offsets: vec![InputOffset {
                dataset,
                partition: 1,
                offset: 42,
            }],
            ..Default::default()
        };
        let decoded = TaskSnapshot::decode(snapshot.encode().unwrap().as_slice()).unwrap();
        assert_eq!(decoded.restore_offset(JobId(1), &dataset, 1), 42);
        assert_eq!(decoded.restore_offset(JobId(1), &dataset, 0), 0);

        // restoring into another job starts its datasets from scratch
        let other = DatasetId {
            job_id: JobId(2),
            ..dataset
        };
        assert_eq!(decoded.restore_offset(JobId(2), &other, 1), 0);
    }
}
