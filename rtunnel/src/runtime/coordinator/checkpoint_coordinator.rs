//! Per pipeline checkpoint coordination: `IDLE -> TRIGGERED -> COMPLETED -> IDLE`, or
//! `TRIGGERED -> ABORTED -> IDLE` on a decline, a timeout or a storage failure.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::api::checkpoint::{
    CheckpointBarrier, CheckpointType, CompletedCheckpoint, StateKey, TaskStateBlob,
};
use crate::api::error::EngineError;
use crate::api::runtime::{CheckpointId, JobId, PipelineId, TaskId};
use crate::metrics::metric::{Counter, Gauge};
use crate::metrics::{register_counter, register_gauge, Tag};
use crate::storage::checkpoint::{CheckpointStorage, CheckpointStorageWrap};
use crate::utils::date_time::current_timestamp_millis;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointState {
    Idle,
    Triggered,
    Completed,
    Aborted,
}

#[derive(Debug)]
struct PendingCheckpoint {
    barrier: CheckpointBarrier,
    triggered_at: Instant,
    not_yet_acknowledged: HashSet<TaskId>,
    states: BTreeMap<StateKey, Vec<u8>>,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// inject the barrier at the pipeline heads and wait for acks
    Triggered(CheckpointBarrier),
    /// every task already finished, their final states make up the checkpoint
    Completed(CompletedCheckpoint),
    Rejected(String),
}

pub struct CheckpointCoordinator {
    job_id: JobId,
    pipeline_id: PipelineId,
    storage: Arc<Mutex<CheckpointStorageWrap>>,
    interval: Duration,
    timeout: Duration,

    state: CheckpointState,
    latest_checkpoint_id: CheckpointId,
    pending: Option<PendingCheckpoint>,
    latest_completed: Option<CompletedCheckpoint>,
    last_trigger: Instant,

    /// final snapshots of tasks that ended cleanly in the current generation
    finished: BTreeMap<TaskId, Option<(StateKey, Vec<u8>)>>,

    completed_counter: Counter,
    aborted_counter: Counter,
    latest_id_gauge: Gauge,
}

impl CheckpointCoordinator {
    pub fn new(
        job_id: JobId,
        pipeline_id: PipelineId,
        storage: Arc<Mutex<CheckpointStorageWrap>>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let tags = vec![
            Tag::new("job_id", job_id.0),
            Tag::new("pipeline_id", pipeline_id.0),
        ];
        CheckpointCoordinator {
            job_id,
            pipeline_id,
            storage,
            interval,
            timeout,
            state: CheckpointState::Idle,
            latest_checkpoint_id: CheckpointId::default(),
            pending: None,
            latest_completed: None,
            last_trigger: Instant::now(),
            finished: BTreeMap::new(),
            completed_counter: register_counter("checkpoint_completed", tags.clone()),
            aborted_counter: register_counter("checkpoint_aborted", tags.clone()),
            latest_id_gauge: register_gauge("checkpoint_latest_id", tags),
        }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    pub fn is_periodic(&self) -> bool {
        self.interval > Duration::ZERO
    }

    pub fn latest_checkpoint_id(&self) -> CheckpointId {
        self.latest_checkpoint_id
    }

    pub fn latest_completed(&self) -> Option<&CompletedCheckpoint> {
        self.latest_completed.as_ref()
    }

    pub fn pending_checkpoint_id(&self) -> Option<CheckpointId> {
        self.pending.as_ref().map(|p| p.barrier.checkpoint_id)
    }

    /// Latest completed checkpoint of `job_id` for this pipeline. Checkpoint ids keep
    /// increasing from the restored one.
    pub fn restore(&mut self, job_id: JobId) -> Result<Option<CompletedCheckpoint>, EngineError> {
        let restored = {
            let mut storage = lock!(self.storage, "checkpoint storage")?;
            storage
                .load_latest(job_id, self.pipeline_id)
                .map_err(|e| EngineError::Storage(format!("{:#}", e)))?
        };

        if let Some(ck) = restored.as_ref() {
            info!(
                "{} of {} restore from {} of {}",
                self.pipeline_id, self.job_id, ck.checkpoint_id, ck.job_id
            );
            if ck.checkpoint_id > self.latest_checkpoint_id {
                self.latest_checkpoint_id = ck.checkpoint_id;
            }
            self.latest_completed = Some(ck.clone());
        }
        Ok(restored)
    }

    /// Forget everything bound to the tasks of the previous generation.
    pub fn reset_for_restart(&mut self) {
        if self.pending.is_some() {
            self.abort("pipeline restarting");
        }
        self.finished.clear();
        self.last_trigger = Instant::now();
    }

    pub fn should_trigger(&self, now: Instant) -> bool {
        self.is_periodic()
            && self.pending.is_none()
            && now.duration_since(self.last_trigger) >= self.interval
    }

    /// `tasks` are all tasks of the current generation; finished ones take part through
    /// their final snapshot.
    pub fn trigger(&mut self, checkpoint_type: CheckpointType, tasks: &[TaskId]) -> TriggerOutcome {
        if let Some(pending) = self.pending.as_ref() {
            return TriggerOutcome::Rejected(format!(
                "{} is still pending",
                pending.barrier.checkpoint_id
            ));
        }

        let checkpoint_id = self.latest_checkpoint_id.next();
        self.latest_checkpoint_id = checkpoint_id;
        self.last_trigger = Instant::now();

        let barrier = CheckpointBarrier {
            checkpoint_id,
            timestamp: current_timestamp_millis(),
            checkpoint_type,
        };
        let not_yet_acknowledged: HashSet<TaskId> = tasks
            .iter()
            .filter(|task_id| !self.finished.contains_key(task_id))
            .map(|x| *x)
            .collect();

        info!(
            "trigger {} {} of {}/{}, waiting for {} tasks",
            checkpoint_type,
            checkpoint_id,
            self.job_id,
            self.pipeline_id,
            not_yet_acknowledged.len()
        );
        self.state = CheckpointState::Triggered;
        self.pending = Some(PendingCheckpoint {
            barrier,
            triggered_at: Instant::now(),
            not_yet_acknowledged,
            states: BTreeMap::new(),
        });

        match self.try_complete() {
            Ok(Some(completed)) => TriggerOutcome::Completed(completed),
            Ok(None) => TriggerOutcome::Triggered(barrier),
            Err(e) => TriggerOutcome::Rejected(e.to_string()),
        }
    }

    pub fn acknowledge(
        &mut self,
        checkpoint_id: CheckpointId,
        task_id: TaskId,
        state_key: StateKey,
        state: Vec<u8>,
    ) -> Result<Option<CompletedCheckpoint>, EngineError> {
        let pending = match self.pending.as_mut() {
            Some(pending) if pending.barrier.checkpoint_id == checkpoint_id => pending,
            _ => {
                warn!(
                    "ignore late ack of {} from {} in {}/{}",
                    checkpoint_id, task_id, self.job_id, self.pipeline_id
                );
                return Ok(None);
            }
        };

        if !pending.not_yet_acknowledged.remove(&task_id) {
            warn!("unexpected ack of {} from {}", checkpoint_id, task_id);
            return Ok(None);
        }
        pending.states.insert(state_key, state);

        self.try_complete()
    }

    /// A task ended cleanly. Its final snapshot stands in for its acks from now on.
    pub fn task_finished(
        &mut self,
        task_id: TaskId,
        final_state: Option<(StateKey, Vec<u8>)>,
    ) -> Result<Option<CompletedCheckpoint>, EngineError> {
        self.finished.insert(task_id, final_state.clone());

        let acknowledged = match self.pending.as_mut() {
            Some(pending) => {
                if pending.not_yet_acknowledged.remove(&task_id) {
                    if let Some((key, state)) = final_state {
                        pending.states.entry(key).or_insert(state);
                    }
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if acknowledged {
            self.try_complete()
        } else {
            Ok(None)
        }
    }

    pub fn decline(&mut self, checkpoint_id: CheckpointId, task_id: TaskId, reason: &str) {
        if self.pending_checkpoint_id() == Some(checkpoint_id) {
            self.abort(format!("{} declined: {}", task_id, reason).as_str());
        }
    }

    /// Abort the pending checkpoint once it outlived the timeout.
    pub fn check_timeout(&mut self, now: Instant) -> Option<EngineError> {
        let (checkpoint_id, elapsed) = match self.pending.as_ref() {
            Some(pending) => (
                pending.barrier.checkpoint_id,
                now.duration_since(pending.triggered_at),
            ),
            None => return None,
        };
        if elapsed < self.timeout {
            return None;
        }

        let err = EngineError::CheckpointTimeout {
            pipeline_id: self.pipeline_id,
            checkpoint_id,
            timeout_ms: self.timeout.as_millis() as u64,
        };
        self.abort(err.to_string().as_str());
        Some(err)
    }

    pub fn abort(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            warn!(
                "abort {} of {}/{}: {}",
                pending.barrier.checkpoint_id, self.job_id, self.pipeline_id, reason
            );
            self.state = CheckpointState::Aborted;
            self.aborted_counter.fetch_add(1);
        }
        self.state = CheckpointState::Idle;
    }

    fn try_complete(&mut self) -> Result<Option<CompletedCheckpoint>, EngineError> {
        let ready = self
            .pending
            .as_ref()
            .map(|p| p.not_yet_acknowledged.is_empty())
            .unwrap_or(false);
        if !ready {
            return Ok(None);
        }
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(None),
        };

        let mut states = pending.states;
        for final_state in self.finished.values() {
            if let Some((key, state)) = final_state {
                states.entry(*key).or_insert_with(|| state.clone());
            }
        }

        let checkpoint = CompletedCheckpoint {
            job_id: self.job_id,
            pipeline_id: self.pipeline_id,
            checkpoint_id: pending.barrier.checkpoint_id,
            checkpoint_type: pending.barrier.checkpoint_type,
            trigger_timestamp: pending.barrier.timestamp,
            completed_timestamp: current_timestamp_millis(),
            task_states: states
                .into_iter()
                .map(|(key, state)| TaskStateBlob { key, state })
                .collect(),
        };

        if let Err(e) = self.persist(&checkpoint) {
            self.state = CheckpointState::Aborted;
            self.aborted_counter.fetch_add(1);
            error!(
                "persist {} of {}/{} error. {}",
                checkpoint.checkpoint_id, self.job_id, self.pipeline_id, e
            );
            self.state = CheckpointState::Idle;
            return Err(e);
        }

        self.state = CheckpointState::Completed;
        info!(
            "{} {} of {}/{} completed with {} task states",
            checkpoint.checkpoint_type,
            checkpoint.checkpoint_id,
            self.job_id,
            self.pipeline_id,
            checkpoint.task_states.len()
        );
        self.completed_counter.fetch_add(1);
        self.latest_id_gauge.store(checkpoint.checkpoint_id.0 as i64);
        self.latest_completed = Some(checkpoint.clone());
        self.state = CheckpointState::Idle;

        Ok(Some(checkpoint))
    }

    fn persist(&self, checkpoint: &CompletedCheckpoint) -> Result<(), EngineError> {
        let mut storage = lock!(self.storage, "checkpoint storage")?;
        storage
            .save(checkpoint)
            .map_err(|e| EngineError::Storage(format!("{:#}", e)))?;
        match storage.retire(self.job_id, self.pipeline_id, checkpoint.checkpoint_id) {
            Ok(n) if n > 0 => debug!("retire {} checkpoints of {}", n, self.pipeline_id),
            Ok(_) => {}
            Err(e) => warn!("retire checkpoints of {} error. {}", self.pipeline_id, e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use crate::api::checkpoint::{CheckpointType, StateKey};
    use crate::api::error::EngineError;
    use crate::api::runtime::{CheckpointId, JobId, PipelineId, TaskId, VertexId};
    use crate::runtime::coordinator::checkpoint_coordinator::{
        CheckpointCoordinator, CheckpointState, TriggerOutcome,
    };
    use crate::storage::checkpoint::memory_checkpoint_storage::MemoryCheckpointStorage;
    use crate::storage::checkpoint::{CheckpointStorage, CheckpointStorageWrap};

    fn storage() -> Arc<Mutex<CheckpointStorageWrap>> {
        Arc::new(Mutex::new(CheckpointStorageWrap::MemoryCheckpointStorage(
            MemoryCheckpointStorage::new(),
        )))
    }

    fn key(subtask_index: u32) -> StateKey {
        StateKey::Task {
            vertex_id: VertexId(1),
            subtask_index,
        }
    }

    fn coordinator(storage: Arc<Mutex<CheckpointStorageWrap>>) -> CheckpointCoordinator {
        CheckpointCoordinator::new(
            JobId(1),
            PipelineId(1),
            storage,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
    }

    fn triggered(outcome: TriggerOutcome) -> CheckpointId {
        match outcome {
            TriggerOutcome::Triggered(barrier) => barrier.checkpoint_id,
            outcome => panic!("unexpected {:?}", outcome),
        }
    }

    #[test]
    pub fn complete_after_all_acks_test() {
        let storage = storage();
        let mut coordinator = coordinator(storage.clone());
        let tasks = [TaskId(1), TaskId(2)];

        let ck = triggered(coordinator.trigger(CheckpointType::Checkpoint, &tasks));
        assert_eq!(ck, CheckpointId(1));
        assert_eq!(coordinator.state(), CheckpointState::Triggered);
        assert!(matches!(
            coordinator.trigger(CheckpointType::Checkpoint, &tasks),
            TriggerOutcome::Rejected(_)
        ));

        assert!(coordinator.acknowledge(ck, TaskId(1), key(0), vec![1]).unwrap().is_none());
        // duplicate and foreign acks are ignored
        assert!(coordinator.acknowledge(ck, TaskId(1), key(0), vec![1]).unwrap().is_none());
        assert!(coordinator.acknowledge(ck, TaskId(9), key(9), vec![9]).unwrap().is_none());

        let completed = coordinator
            .acknowledge(ck, TaskId(2), key(1), vec![2])
            .unwrap()
            .unwrap();
        assert_eq!(completed.task_states.len(), 2);
        assert_eq!(coordinator.state(), CheckpointState::Idle);

        let ck2 = triggered(coordinator.trigger(CheckpointType::Checkpoint, &tasks));
        assert_eq!(ck2, CheckpointId(2));
        coordinator.acknowledge(ck2, TaskId(1), key(0), vec![3]).unwrap();
        coordinator.acknowledge(ck2, TaskId(2), key(1), vec![4]).unwrap();

        // only the latest completed checkpoint is retained
        let latest = storage
            .lock()
            .unwrap()
            .load_latest(JobId(1), PipelineId(1))
            .unwrap()
            .unwrap();
        assert_eq!(latest.checkpoint_id, CheckpointId(2));
        assert_eq!(latest.state_of(&key(1)), Some(&[4u8][..]));
        assert_eq!(
            storage
                .lock()
                .unwrap()
                .retire(JobId(1), PipelineId(1), CheckpointId(2))
                .unwrap(),
            0
        );
    }

    #[test]
    pub fn decline_and_timeout_abort_test() {
        let mut coordinator = coordinator(storage());
        let tasks = [TaskId(1)];

        let ck = triggered(coordinator.trigger(CheckpointType::Checkpoint, &tasks));
        coordinator.decline(ck, TaskId(1), "snapshot failed");
        assert_eq!(coordinator.state(), CheckpointState::Idle);
        assert!(coordinator.pending_checkpoint_id().is_none());
        // a late ack of the aborted checkpoint is dropped
        assert!(coordinator.acknowledge(ck, TaskId(1), key(0), vec![]).unwrap().is_none());

        let ck2 = triggered(coordinator.trigger(CheckpointType::Checkpoint, &tasks));
        assert!(ck2 > ck);
        assert!(coordinator.check_timeout(Instant::now()).is_none());
        let err = coordinator
            .check_timeout(Instant::now() + Duration::from_millis(100))
            .unwrap();
        assert!(matches!(err, EngineError::CheckpointTimeout { checkpoint_id, .. } if checkpoint_id == ck2));
        assert!(coordinator.latest_completed().is_none());

        let ck3 = triggered(coordinator.trigger(CheckpointType::Checkpoint, &tasks));
        assert_eq!(ck3, CheckpointId(3));
    }

    #[test]
    pub fn finished_tasks_test() {
        let mut coordinator = coordinator(storage());
        let tasks = [TaskId(1), TaskId(2)];

        coordinator
            .task_finished(TaskId(1), Some((key(0), vec![7])))
            .unwrap();
        let ck = triggered(coordinator.trigger(CheckpointType::Checkpoint, &tasks));
        let completed = coordinator
            .acknowledge(ck, TaskId(2), key(1), vec![8])
            .unwrap()
            .unwrap();
        assert_eq!(completed.state_of(&key(0)), Some(&[7u8][..]));

        // finishing while pending counts as the ack
        let ck = triggered(coordinator.trigger(CheckpointType::Savepoint, &tasks));
        let completed = coordinator
            .task_finished(TaskId(2), Some((key(1), vec![9])))
            .unwrap()
            .unwrap();
        assert_eq!(completed.checkpoint_id, ck);
        assert_eq!(completed.checkpoint_type, CheckpointType::Savepoint);

        // nothing left to wait for
        match coordinator.trigger(CheckpointType::Checkpoint, &tasks) {
            TriggerOutcome::Completed(ck) => assert_eq!(ck.task_states.len(), 2),
            outcome => panic!("unexpected {:?}", outcome),
        }
    }

    #[test]
    pub fn restore_test() {
        let storage = storage();
        {
            let mut coordinator = coordinator(storage.clone());
            let ck = triggered(coordinator.trigger(CheckpointType::Checkpoint, &[TaskId(1)]));
            coordinator.acknowledge(ck, TaskId(1), key(0), vec![5]).unwrap();
        }

        let mut restored = CheckpointCoordinator::new(
            JobId(2),
            PipelineId(1),
            storage,
            Duration::ZERO,
            Duration::from_secs(1),
        );
        assert!(!restored.is_periodic());
        let ck = restored.restore(JobId(1)).unwrap().unwrap();
        assert_eq!(ck.state_of(&key(0)), Some(&[5u8][..]));
        assert!(restored.restore(JobId(3)).unwrap().is_none());

        let next = triggered(restored.trigger(CheckpointType::Checkpoint, &[TaskId(10)]));
        assert_eq!(next, CheckpointId(2));
    }

    #[test]
    pub fn periodic_trigger_test() {
        let mut coordinator = coordinator(storage());
        let now = Instant::now();
        assert!(coordinator.should_trigger(now + Duration::from_millis(20)));
        coordinator.trigger(CheckpointType::Checkpoint, &[TaskId(1)]);
        assert!(!coordinator.should_trigger(now + Duration::from_secs(1)));
        coordinator.reset_for_restart();
        assert!(coordinator.pending_checkpoint_id().is_none());
    }
}
