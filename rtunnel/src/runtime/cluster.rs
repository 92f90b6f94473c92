//! In-process cluster: one resource manager, the intermediate store and a set of workers,
//! each running a [`TaskExecutionService`] and a heartbeat loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use dashmap::DashMap;

use crate::api::cluster::EngineConfig;
use crate::api::error::EngineError;
use crate::api::factory::ConnectorRegistry;
use crate::api::runtime::WorkerId;
use crate::channel::Sender;
use crate::runtime::intermediate::IntermediateStore;
use crate::runtime::resource::{LostWorker, ResourceManager};
use crate::runtime::wire::{encode, MessageKind, OperationMessage, TaskGroupDeployment};
use crate::runtime::worker::heart_beat::start_heartbeat;
use crate::runtime::worker::{OperationRouter, TaskExecutionService};
use crate::utils::IdGenerator;

struct WorkerHandle {
    service: Arc<TaskExecutionService>,
    heartbeat_running: Arc<AtomicBool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    fn stop_heartbeat(&self) {
        self.heartbeat_running.store(false, Ordering::SeqCst);
        let handle = match self.heartbeat.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("heartbeat thread of {} panicked", self.service.worker_id());
            }
        }
    }
}

/// Routes operations by slot: the resource manager knows the worker of every slot.
struct ClusterRouter {
    resource_manager: Arc<ResourceManager>,
    workers: Arc<DashMap<WorkerId, Arc<WorkerHandle>>>,
}

impl OperationRouter for ClusterRouter {
    fn route(&self, message: OperationMessage) -> Result<(), EngineError> {
        let slot_id = message.location.slot_id;
        let worker_id = self.resource_manager.worker_of(slot_id).ok_or_else(|| {
            EngineError::Internal(format!("{} is not hosted by any worker", slot_id))
        })?;
        let service = self
            .workers
            .get(&worker_id)
            .map(|w| w.service.clone())
            .ok_or_else(|| EngineError::Internal(format!("{} is not running", worker_id)))?;

        let bytes = encode(MessageKind::Operation, &message)?;
        service.deliver_operation(bytes.as_slice())
    }
}

pub struct LocalCluster {
    config: EngineConfig,
    registry: Arc<ConnectorRegistry>,
    resource_manager: Arc<ResourceManager>,
    store: Arc<IntermediateStore>,
    workers: Arc<DashMap<WorkerId, Arc<WorkerHandle>>>,
    router: Arc<ClusterRouter>,
    worker_id_generator: IdGenerator,
}

impl LocalCluster {
    pub fn new(config: EngineConfig, registry: Arc<ConnectorRegistry>) -> Self {
        let resource_manager = Arc::new(ResourceManager::new(
            config.heartbeat_timeout(),
            config.allocation_log_capacity,
        ));
        let workers = Arc::new(DashMap::new());
        let router = Arc::new(ClusterRouter {
            resource_manager: resource_manager.clone(),
            workers: workers.clone(),
        });
        LocalCluster {
            config,
            registry,
            resource_manager,
            store: Arc::new(IntermediateStore::new()),
            workers,
            router,
            worker_id_generator: IdGenerator::new(),
        }
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }

    pub fn store(&self) -> &Arc<IntermediateStore> {
        &self.store
    }

    pub fn router(&self) -> Arc<dyn OperationRouter> {
        self.router.clone()
    }

    /// Start a worker with `slots_per_worker` slots and register it.
    pub fn add_worker(&self) -> anyhow::Result<WorkerId> {
        let worker_id = WorkerId(self.worker_id_generator.next_id() as u32);
        let service = Arc::new(TaskExecutionService::new(
            worker_id,
            self.registry.clone(),
            self.store.clone(),
            self.router.clone(),
            self.config.poll_policy.clone(),
            self.config.channel_capacity,
        ));

        self.resource_manager
            .worker_added(worker_id, self.config.slots_per_worker)?;

        let heartbeat_running = Arc::new(AtomicBool::new(true));
        let resource_manager = self.resource_manager.clone();
        let heartbeat = start_heartbeat(
            worker_id,
            self.config.heartbeat_interval(),
            heartbeat_running.clone(),
            move || resource_manager.heartbeat(worker_id),
        )?;

        self.workers.insert(
            worker_id,
            Arc::new(WorkerHandle {
                service,
                heartbeat_running,
                heartbeat: Mutex::new(Some(heartbeat)),
            }),
        );
        Ok(worker_id)
    }

    /// Membership removal: the worker leaves, its task groups are lost.
    pub fn remove_worker(&self, worker_id: WorkerId) -> anyhow::Result<Option<LostWorker>> {
        let lost = self.resource_manager.worker_removed(worker_id)?;
        self.evict_worker(worker_id);
        Ok(lost)
    }

    /// Stop everything still running on a worker that is no longer a cluster member.
    pub fn evict_worker(&self, worker_id: WorkerId) {
        if let Some((_, worker)) = self.workers.remove(&worker_id) {
            worker.stop_heartbeat();
            worker.service.shutdown();
            info!("{} evicted", worker_id);
        }
    }

    /// The worker keeps running its tasks but stops reporting liveness.
    pub fn stop_heartbeat(&self, worker_id: WorkerId) -> bool {
        let worker = self.workers.get(&worker_id).map(|w| w.value().clone());
        match worker {
            Some(worker) => {
                worker.stop_heartbeat();
                true
            }
            None => false,
        }
    }

    pub fn deploy(
        &self,
        worker_id: WorkerId,
        deployment: &TaskGroupDeployment,
        reporter: Sender<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let service = self
            .workers
            .get(&worker_id)
            .map(|w| w.service.clone())
            .ok_or_else(|| EngineError::Internal(format!("{} is not running", worker_id)))?;
        let bytes = encode(MessageKind::TaskGroupDeployment, deployment)?;
        service.deploy_task(bytes.as_slice(), reporter)
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self.workers.iter().map(|w| *w.key()).collect();
        workers.sort();
        workers
    }

    pub fn running_task_count(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.service.running_task_count())
            .sum()
    }

    pub fn shutdown(&self) {
        let worker_ids = self.workers();
        for worker_id in worker_ids {
            self.evict_worker(worker_id);
            if let Err(e) = self.resource_manager.worker_removed(worker_id) {
                warn!("unregister {} error. {}", worker_id, e);
            }
        }
        info!("local cluster shutdown");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::api::cluster::EngineConfig;
    use crate::api::runtime::{SlotId, TaskGroupId, TaskId, TaskLocation};
    use crate::functions::default_registry;
    use crate::runtime::cluster::LocalCluster;
    use crate::runtime::wire::{ControlOp, OperationMessage};

    #[test]
    pub fn add_and_remove_worker_test() {
        let cluster = LocalCluster::new(EngineConfig::new_local(0, 3), Arc::new(default_registry()));
        let a = cluster.add_worker().unwrap();
        let b = cluster.add_worker().unwrap();
        assert_eq!(cluster.workers(), vec![a, b]);
        assert_eq!(cluster.resource_manager().total_slots(), 6);

        let lost = cluster.remove_worker(a).unwrap().unwrap();
        assert!(lost.lost.is_empty());
        assert_eq!(cluster.workers(), vec![b]);
        assert_eq!(cluster.resource_manager().total_slots(), 3);
        assert!(cluster.remove_worker(a).unwrap().is_none());

        cluster.shutdown();
        assert!(cluster.workers().is_empty());
    }

    #[test]
    pub fn route_to_unknown_slot_test() {
        let cluster = LocalCluster::new(EngineConfig::new_local(0, 1), Arc::new(default_registry()));
        cluster.add_worker().unwrap();
        let r = cluster.router().route(OperationMessage {
            location: TaskLocation::new(SlotId(999), TaskGroupId(1), TaskId(1)),
            op: ControlOp::Cancel,
        });
        assert!(r.is_err());
        cluster.shutdown();
    }
}
