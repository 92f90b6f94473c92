//! Cluster wide slot pool. Every mutation goes through a single mutex, so concurrent
//! pipeline scheduling can never bind one slot to two task groups.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::api::error::EngineError;
use crate::api::runtime::{JobId, PipelineId, SlotId, WorkerId};
use crate::metrics::metric::Gauge;
use crate::metrics::register_gauge;
use crate::runtime::resource::slot::{AllocationEvent, Slot, SlotAllocation, SlotOwner, SlotProfile};
use crate::utils::IdGenerator;

pub mod slot;

#[derive(Clone, Debug)]
struct WorkerProfile {
    slot_ids: Vec<SlotId>,
    last_heartbeat: Instant,
}

/// A worker that left the cluster and the task groups it was running.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LostWorker {
    pub worker_id: WorkerId,
    pub lost: Vec<SlotOwner>,
}

#[derive(Debug)]
struct ResourceState {
    workers: BTreeMap<WorkerId, WorkerProfile>,
    slots: BTreeMap<SlotId, Slot>,
    /// the most recent events, oldest dropped first
    allocation_log: VecDeque<AllocationEvent>,
    allocation_log_capacity: usize,
}

impl ResourceState {
    fn new(allocation_log_capacity: usize) -> Self {
        ResourceState {
            workers: BTreeMap::new(),
            slots: BTreeMap::new(),
            allocation_log: VecDeque::new(),
            allocation_log_capacity,
        }
    }

    fn log(&mut self, event: AllocationEvent) {
        if self.allocation_log_capacity == 0 {
            return;
        }
        while self.allocation_log.len() >= self.allocation_log_capacity {
            self.allocation_log.pop_front();
        }
        self.allocation_log.push_back(event);
    }

    fn free_count(&self) -> usize {
        self.slots.values().filter(|s| s.is_free()).count()
    }

    /// Free slots picked round-robin over workers, so that a pipeline spreads out.
    fn pick_free(&self, count: usize) -> Vec<SlotId> {
        let mut per_worker: Vec<Vec<SlotId>> = self
            .workers
            .values()
            .map(|w| {
                w.slot_ids
                    .iter()
                    .filter(|id| self.slots.get(id).map(|s| s.is_free()).unwrap_or(false))
                    .map(|x| *x)
                    .rev()
                    .collect()
            })
            .collect();

        let mut picked = Vec::with_capacity(count);
        while picked.len() < count {
            let mut progress = false;
            for free in per_worker.iter_mut() {
                if picked.len() == count {
                    break;
                }
                if let Some(slot_id) = free.pop() {
                    picked.push(slot_id);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        picked
    }

    fn release_where<F>(&mut self, predicate: F) -> Vec<SlotOwner>
    where
        F: Fn(&Slot) -> bool,
    {
        let mut released = Vec::new();
        for slot in self.slots.values_mut() {
            if slot.is_free() || !predicate(slot) {
                continue;
            }
            if let Some(owner) = slot.owner.take() {
                released.push((slot.slot_id, owner));
            }
        }
        for (slot_id, owner) in released.iter() {
            self.log(AllocationEvent::Released {
                slot_id: *slot_id,
                owner: *owner,
            });
        }
        released.into_iter().map(|(_, owner)| owner).collect()
    }

    fn remove_worker(&mut self, worker_id: WorkerId) -> Option<Vec<SlotOwner>> {
        let worker = self.workers.remove(&worker_id)?;
        let lost = self.release_where(|slot| slot.worker_id == worker_id);
        for slot_id in worker.slot_ids {
            self.slots.remove(&slot_id);
        }
        Some(lost)
    }
}

pub struct ResourceManager {
    state: Mutex<ResourceState>,
    slot_id_generator: IdGenerator,
    heartbeat_timeout: Duration,

    free_slots_gauge: Gauge,
    allocated_slots_gauge: Gauge,
}

impl ResourceManager {
    pub fn new(heartbeat_timeout: Duration, allocation_log_capacity: usize) -> Self {
        ResourceManager {
            state: Mutex::new(ResourceState::new(allocation_log_capacity)),
            slot_id_generator: IdGenerator::new(),
            heartbeat_timeout,
            free_slots_gauge: register_gauge("free_slots", vec![]),
            allocated_slots_gauge: register_gauge("allocated_slots", vec![]),
        }
    }

    fn update_gauges(&self, state: &ResourceState) {
        let free = state.free_count();
        self.free_slots_gauge.store(free as i64);
        self.allocated_slots_gauge
            .store((state.slots.len() - free) as i64);
    }

    pub fn worker_added(&self, worker_id: WorkerId, slots: u32) -> anyhow::Result<Vec<SlotId>> {
        let mut state = lock!(self.state, "resource manager")?;
        if state.workers.contains_key(&worker_id) {
            return Err(anyhow!("{} already registered", worker_id));
        }

        let slot_ids: Vec<SlotId> = (0..slots)
            .map(|_| SlotId(self.slot_id_generator.next_id()))
            .collect();
        for slot_id in &slot_ids {
            state.slots.insert(*slot_id, Slot::new(*slot_id, worker_id));
        }
        state.workers.insert(
            worker_id,
            WorkerProfile {
                slot_ids: slot_ids.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        self.update_gauges(&state);

        info!("{} joined with {} slots", worker_id, slots);
        Ok(slot_ids)
    }

    /// Membership event: the worker is gone, everything bound to its slots is lost.
    pub fn worker_removed(&self, worker_id: WorkerId) -> anyhow::Result<Option<LostWorker>> {
        let mut state = lock!(self.state, "resource manager")?;
        let lost = state.remove_worker(worker_id);
        self.update_gauges(&state);

        Ok(lost.map(|lost| {
            warn!("{} left, {} task groups lost", worker_id, lost.len());
            LostWorker { worker_id, lost }
        }))
    }

    pub fn heartbeat(&self, worker_id: WorkerId) -> anyhow::Result<()> {
        let mut state = lock!(self.state, "resource manager")?;
        match state.workers.get_mut(&worker_id) {
            Some(worker) => {
                worker.last_heartbeat = Instant::now();
                Ok(())
            }
            None => Err(anyhow!("heartbeat from unknown {}", worker_id)),
        }
    }

    /// Remove workers whose last heartbeat is older than the timeout.
    pub fn check_heartbeats(&self, now: Instant) -> anyhow::Result<Vec<LostWorker>> {
        let mut state = lock!(self.state, "resource manager")?;
        let expired: Vec<WorkerId> = state
            .workers
            .iter()
            .filter(|(_, w)| now.saturating_duration_since(w.last_heartbeat) > self.heartbeat_timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut lost_workers = Vec::new();
        for worker_id in expired {
            if let Some(lost) = state.remove_worker(worker_id) {
                error!(
                    "{} heartbeat timeout after {}ms, {} task groups lost",
                    worker_id,
                    self.heartbeat_timeout.as_millis(),
                    lost.len()
                );
                lost_workers.push(LostWorker { worker_id, lost });
            }
        }
        if !lost_workers.is_empty() {
            self.update_gauges(&state);
        }
        Ok(lost_workers)
    }

    /// All or nothing: either every profile gets a slot or nothing is allocated.
    pub fn apply_resources(
        &self,
        job_id: JobId,
        pipeline_id: PipelineId,
        profiles: &[SlotProfile],
    ) -> Result<Vec<SlotAllocation>, EngineError> {
        let mut state = lock!(self.state, "resource manager")?;

        let free = state.free_count();
        if free < profiles.len() {
            warn!(
                "{} of {} requires {} slots, only {} free",
                pipeline_id,
                job_id,
                profiles.len(),
                free
            );
            return Err(EngineError::ResourceInsufficient {
                job_id,
                pipeline_id,
                required: profiles.len(),
                free,
            });
        }

        let slot_ids = state.pick_free(profiles.len());
        let mut allocations = Vec::with_capacity(profiles.len());
        for (profile, slot_id) in profiles.iter().zip(slot_ids.into_iter()) {
            let owner = SlotOwner {
                job_id,
                pipeline_id,
                task_group_id: profile.task_group_id,
            };
            let slot = state
                .slots
                .get_mut(&slot_id)
                .ok_or_else(|| EngineError::Internal(format!("{} vanished", slot_id)))?;
            slot.owner = Some(owner);
            let worker_id = slot.worker_id;
            state.log(AllocationEvent::Allocated { slot_id, owner });

            debug!("{} allocated to {}", slot_id, owner);
            allocations.push(SlotAllocation {
                slot_id,
                worker_id,
                task_group_id: profile.task_group_id,
            });
        }
        self.update_gauges(&state);

        info!(
            "{} of {} allocated {} slots",
            pipeline_id,
            job_id,
            allocations.len()
        );
        Ok(allocations)
    }

    pub fn release_resources(&self, job_id: JobId, pipeline_id: PipelineId) -> anyhow::Result<usize> {
        let mut state = lock!(self.state, "resource manager")?;
        let released = state.release_where(|slot| {
            slot.owner
                .map(|o| o.job_id == job_id && o.pipeline_id == pipeline_id)
                .unwrap_or(false)
        });
        self.update_gauges(&state);

        if !released.is_empty() {
            info!(
                "{} of {} released {} slots",
                pipeline_id,
                job_id,
                released.len()
            );
        }
        Ok(released.len())
    }

    pub fn free_slots(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.free_count(),
            Err(_) => 0,
        }
    }

    pub fn total_slots(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.slots.len(),
            Err(_) => 0,
        }
    }

    pub fn worker_of(&self, slot_id: SlotId) -> Option<WorkerId> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.slots.get(&slot_id).map(|s| s.worker_id))
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        match self.state.lock() {
            Ok(state) => state.workers.keys().map(|x| *x).collect(),
            Err(_) => vec![],
        }
    }

    pub fn allocation_log(&self) -> Vec<AllocationEvent> {
        match self.state.lock() {
            Ok(state) => state.allocation_log.iter().map(|e| e.clone()).collect(),
            Err(_) => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::api::error::EngineError;
    use crate::api::runtime::{JobId, PipelineId, SlotId, TaskGroupId, WorkerId};
    use crate::runtime::resource::slot::{AllocationEvent, SlotOwner, SlotProfile};
    use crate::runtime::resource::ResourceManager;

    fn profiles(start: u64, n: u64) -> Vec<SlotProfile> {
        (start..start + n)
            .map(|id| SlotProfile {
                task_group_id: TaskGroupId(id),
            })
            .collect()
    }

    fn manager(workers: u32, slots: u32) -> ResourceManager {
        let rm = ResourceManager::new(Duration::from_secs(50), 8192);
        for w in 1..=workers {
            rm.worker_added(WorkerId(w), slots).unwrap();
        }
        rm
    }

    #[test]
    pub fn insufficient_leaves_nothing_test() {
        let rm = manager(1, 2);
        let r = rm.apply_resources(JobId(1), PipelineId(1), &profiles(1, 3));
        assert_eq!(
            r,
            Err(EngineError::ResourceInsufficient {
                job_id: JobId(1),
                pipeline_id: PipelineId(1),
                required: 3,
                free: 2,
            })
        );
        assert_eq!(rm.free_slots(), 2);
        assert!(rm.allocation_log().is_empty());
    }

    #[test]
    pub fn spread_and_release_test() {
        let rm = manager(2, 2);
        let allocations = rm
            .apply_resources(JobId(1), PipelineId(1), &profiles(1, 2))
            .unwrap();
        // round-robin over workers
        assert_ne!(allocations[0].worker_id, allocations[1].worker_id);
        assert_eq!(rm.free_slots(), 2);

        assert_eq!(rm.release_resources(JobId(1), PipelineId(1)).unwrap(), 2);
        assert_eq!(rm.release_resources(JobId(1), PipelineId(1)).unwrap(), 0);
        assert_eq!(rm.free_slots(), 4);
    }

    #[test]
    pub fn worker_lost_test() {
        let rm = manager(2, 1);
        let allocations = rm
            .apply_resources(JobId(1), PipelineId(1), &profiles(1, 2))
            .unwrap();
        let on_worker_2 = allocations
            .iter()
            .find(|a| a.worker_id == WorkerId(2))
            .unwrap();

        let lost = rm.worker_removed(WorkerId(2)).unwrap().unwrap();
        assert_eq!(
            lost.lost,
            vec![SlotOwner {
                job_id: JobId(1),
                pipeline_id: PipelineId(1),
                task_group_id: on_worker_2.task_group_id,
            }]
        );
        assert_eq!(rm.total_slots(), 1);
        assert!(rm.worker_of(on_worker_2.slot_id).is_none());
        assert!(rm.worker_removed(WorkerId(2)).unwrap().is_none());

        // heartbeat timeout goes through the same path
        rm.heartbeat(WorkerId(1)).unwrap();
        assert!(rm.check_heartbeats(Instant::now()).unwrap().is_empty());
        let lost = rm
            .check_heartbeats(Instant::now() + Duration::from_secs(60))
            .unwrap();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].worker_id, WorkerId(1));
        assert!(rm.heartbeat(WorkerId(1)).is_err());
        assert_eq!(rm.total_slots(), 0);
    }

    #[test]
    pub fn concurrent_slot_exclusivity_test() {
        let rm = Arc::new(manager(3, 4));
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let rm = rm.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..50u64 {
                    let pipeline_id = PipelineId(t);
                    let group_base = (t as u64) * 1000 + round * 10;
                    if rm
                        .apply_resources(JobId(1), pipeline_id, &profiles(group_base, 3))
                        .is_ok()
                    {
                        rm.release_resources(JobId(1), pipeline_id).unwrap();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut bound: HashMap<SlotId, SlotOwner> = HashMap::new();
        for event in rm.allocation_log() {
            match event {
                AllocationEvent::Allocated { slot_id, owner } => {
                    assert!(bound.insert(slot_id, owner).is_none(), "{} bound twice", slot_id);
                }
                AllocationEvent::Released { slot_id, owner } => {
                    assert_eq!(bound.remove(&slot_id), Some(owner));
                }
            }
        }
        assert!(bound.is_empty());
        assert_eq!(rm.free_slots(), 12);
    }

    #[test]
    pub fn allocation_log_capacity_test() {
        let rm = ResourceManager::new(Duration::from_secs(50), 4);
        rm.worker_added(WorkerId(1), 2).unwrap();
        for _ in 0..10 {
            rm.apply_resources(JobId(1), PipelineId(1), &profiles(1, 2))
                .unwrap();
            rm.release_resources(JobId(1), PipelineId(1)).unwrap();
        }

        let log = rm.allocation_log();
        assert_eq!(log.len(), 4);
        assert!(matches!(log[0], AllocationEvent::Allocated { .. }));
        assert!(matches!(log[3], AllocationEvent::Released { .. }));

        let silent = ResourceManager::new(Duration::from_secs(50), 0);
        silent.worker_added(WorkerId(1), 1).unwrap();
        silent
            .apply_resources(JobId(1), PipelineId(1), &profiles(1, 1))
            .unwrap();
        assert!(silent.allocation_log().is_empty());
    }
}
