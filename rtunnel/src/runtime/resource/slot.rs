use crate::api::runtime::{JobId, PipelineId, SlotId, TaskGroupId, WorkerId};

/// Requirement of one task group; every task group takes exactly one slot.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub struct SlotProfile {
    pub task_group_id: TaskGroupId,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SlotOwner {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub task_group_id: TaskGroupId,
}

impl std::fmt::Display for SlotOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.job_id, self.pipeline_id, self.task_group_id
        )
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub struct SlotAllocation {
    pub slot_id: SlotId,
    pub worker_id: WorkerId,
    pub task_group_id: TaskGroupId,
}

#[derive(Clone, Debug)]
pub(crate) struct Slot {
    pub slot_id: SlotId,
    pub worker_id: WorkerId,
    pub owner: Option<SlotOwner>,
}

impl Slot {
    pub fn new(slot_id: SlotId, worker_id: WorkerId) -> Self {
        Slot {
            slot_id,
            worker_id,
            owner: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }
}

/// Entry of the allocation log; replaying it never shows a slot bound twice.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum AllocationEvent {
    Allocated { slot_id: SlotId, owner: SlotOwner },
    Released { slot_id: SlotId, owner: SlotOwner },
}
