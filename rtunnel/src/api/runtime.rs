macro_rules! display_id {
    ($name:ident, $prefix:expr) => {
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }
    };
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct JobId(pub u64);
display_id!(JobId, "job");

/// 1-based position of a pipeline in its plan; stable across compiles of the same DAG.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct PipelineId(pub u32);
display_id!(PipelineId, "pipeline");

/// Id of a logical vertex.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct VertexId(pub u64);
display_id!(VertexId, "vertex");

/// Id of a physical task instance. Unique per plan generation.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct TaskId(pub u64);
display_id!(TaskId, "task");

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct TaskGroupId(pub u64);
display_id!(TaskGroupId, "group");

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct SlotId(pub u64);
display_id!(SlotId, "slot");

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct WorkerId(pub u32);
display_id!(WorkerId, "worker");

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct CheckpointId(pub u64);
display_id!(CheckpointId, "ck");

impl CheckpointId {
    #[inline]
    pub fn is_default(&self) -> bool {
        self.0 == 0
    }

    pub fn next(&self) -> CheckpointId {
        CheckpointId(self.0 + 1)
    }
}

/// Where a task executes; control operations are routed by it.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TaskLocation {
    pub slot_id: SlotId,
    pub task_group_id: TaskGroupId,
    pub task_id: TaskId,
}

impl TaskLocation {
    pub fn new(slot_id: SlotId, task_group_id: TaskGroupId, task_id: TaskId) -> Self {
        TaskLocation {
            slot_id,
            task_group_id,
            task_id,
        }
    }
}

impl std::fmt::Display for TaskLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.slot_id, self.task_group_id, self.task_id)
    }
}

/// Identifies a deployed task group of a job.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TaskGroupLocation {
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub task_group_id: TaskGroupId,
}

impl std::fmt::Display for TaskGroupLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.job_id, self.pipeline_id, self.task_group_id
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::api::runtime::{CheckpointId, SlotId, TaskGroupId, TaskId, TaskLocation};

    #[test]
    pub fn display_test() {
        let location = TaskLocation::new(SlotId(3), TaskGroupId(7), TaskId(11));
        assert_eq!(location.to_string(), "slot-3/group-7/task-11");
        assert_eq!(CheckpointId(1).next(), CheckpointId(2));
        assert!(CheckpointId::default().is_default());
    }
}
