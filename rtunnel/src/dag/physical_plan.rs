//! `LogicalDag` to `PhysicalPlan`.
//!
//! Vertices are visited in topological order. A vertex joins the pipeline of its inputs
//! when every input edge is a forward edge (same parallelism, no shuffle) coming from one
//! single pipeline; otherwise it opens a new pipeline. Pipelines are therefore created
//! after every pipeline they read from, which keeps the pipeline graph acyclic.
//!
//! Inside a pipeline all vertices share one parallelism. Subtask `i` of every vertex forms
//! task group `i`, and each coordinated source adds a task group holding its split
//! enumerator.

use std::collections::{BTreeMap, BTreeSet};

use crate::api::checkpoint::StateKey;
use crate::api::config::{JobMode, Partitioner};
use crate::api::error::EngineError;
use crate::api::runtime::{JobId, PipelineId, TaskGroupId, TaskId, TaskLocation, VertexId};
use crate::dag::logical_dag::{LogicalDag, LogicalEdge};
use crate::runtime::intermediate::DatasetId;
use crate::runtime::{ExecutionState, JobImmutableInformation};
use crate::utils::IdGenerator;

/// A logical edge whose endpoints live in different pipelines.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct BoundaryEdge {
    pub edge: LogicalEdge,
    pub upstream_pipeline: PipelineId,
    pub downstream_pipeline: PipelineId,
    pub producer_parallelism: u32,
    /// consumer parallelism
    pub partitions: u32,
    pub partitioner: Partitioner,
    /// the downstream pipeline is deployed only after the upstream one finished
    pub blocking: bool,
}

impl BoundaryEdge {
    pub fn dataset_id(&self, job_id: JobId) -> DatasetId {
        DatasetId {
            job_id,
            input_vertex_id: self.edge.input_vertex_id,
            target_vertex_id: self.edge.target_vertex_id,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PhysicalVertex {
    pub task_id: TaskId,
    pub vertex_id: VertexId,
    pub subtask_index: u32,
    pub parallelism: u32,
    pub task_group_id: TaskGroupId,
    pub generation: u32,
    pub location: Option<TaskLocation>,
    pub state: ExecutionState,
}

impl PhysicalVertex {
    pub fn state_key(&self) -> StateKey {
        StateKey::Task {
            vertex_id: self.vertex_id,
            subtask_index: self.subtask_index,
        }
    }
}

/// Single global instance working for all subtasks of a logical vertex.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CoordinatorVertex {
    pub task_id: TaskId,
    pub vertex_id: VertexId,
    pub task_group_id: TaskGroupId,
    pub generation: u32,
    pub location: Option<TaskLocation>,
    pub state: ExecutionState,
}

impl CoordinatorVertex {
    pub fn state_key(&self) -> StateKey {
        StateKey::Coordinator {
            vertex_id: self.vertex_id,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TaskGroup {
    pub task_group_id: TaskGroupId,
    pub task_ids: Vec<TaskId>,
    /// `None` for a coordinator group
    pub subtask_index: Option<u32>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Pipeline {
    pub pipeline_id: PipelineId,
    pub parallelism: u32,
    /// topological order
    pub vertex_ids: Vec<VertexId>,
    pub coordinated_vertex_ids: Vec<VertexId>,
    pub internal_edges: Vec<LogicalEdge>,
    pub upstream: Vec<BoundaryEdge>,
    pub downstream: Vec<BoundaryEdge>,
    pub generation: u32,
    pub coordinator_vertices: Vec<CoordinatorVertex>,
    pub physical_vertices: Vec<PhysicalVertex>,
    pub task_groups: Vec<TaskGroup>,
}

impl Pipeline {
    fn new(pipeline_id: PipelineId, parallelism: u32) -> Self {
        Pipeline {
            pipeline_id,
            parallelism,
            vertex_ids: Vec::new(),
            coordinated_vertex_ids: Vec::new(),
            internal_edges: Vec::new(),
            upstream: Vec::new(),
            downstream: Vec::new(),
            generation: 0,
            coordinator_vertices: Vec::new(),
            physical_vertices: Vec::new(),
            task_groups: Vec::new(),
        }
    }

    fn instantiate(&mut self, id_generator: &IdGenerator) {
        let generation = self.generation;
        let group_ids: Vec<TaskGroupId> = (0..self.parallelism)
            .map(|_| TaskGroupId(id_generator.next_id()))
            .collect();

        let mut physical_vertices = Vec::new();
        for vertex_id in &self.vertex_ids {
            for subtask_index in 0..self.parallelism {
                physical_vertices.push(PhysicalVertex {
                    task_id: TaskId(id_generator.next_id()),
                    vertex_id: *vertex_id,
                    subtask_index,
                    parallelism: self.parallelism,
                    task_group_id: group_ids[subtask_index as usize],
                    generation,
                    location: None,
                    state: ExecutionState::Created,
                });
            }
        }

        let mut task_groups: Vec<TaskGroup> = group_ids
            .iter()
            .enumerate()
            .map(|(index, task_group_id)| TaskGroup {
                task_group_id: *task_group_id,
                task_ids: physical_vertices
                    .iter()
                    .filter(|v| v.subtask_index == index as u32)
                    .map(|v| v.task_id)
                    .collect(),
                subtask_index: Some(index as u32),
            })
            .collect();

        let mut coordinator_vertices = Vec::new();
        for vertex_id in &self.coordinated_vertex_ids {
            let task_group_id = TaskGroupId(id_generator.next_id());
            let task_id = TaskId(id_generator.next_id());
            coordinator_vertices.push(CoordinatorVertex {
                task_id,
                vertex_id: *vertex_id,
                task_group_id,
                generation,
                location: None,
                state: ExecutionState::Created,
            });
            task_groups.push(TaskGroup {
                task_group_id,
                task_ids: vec![task_id],
                subtask_index: None,
            });
        }

        self.physical_vertices = physical_vertices;
        self.coordinator_vertices = coordinator_vertices;
        self.task_groups = task_groups;
    }

    /// Fresh task instances for a restart, bound to the same logical identities.
    pub fn new_generation(&mut self, id_generator: &IdGenerator) {
        self.generation += 1;
        self.instantiate(id_generator);
    }

    pub fn physical_vertices_of(&self, vertex_id: VertexId) -> Vec<&PhysicalVertex> {
        self.physical_vertices
            .iter()
            .filter(|v| v.vertex_id == vertex_id)
            .collect()
    }

    pub fn physical_vertex(&self, task_id: TaskId) -> Option<&PhysicalVertex> {
        self.physical_vertices.iter().find(|v| v.task_id == task_id)
    }

    pub fn coordinator_vertex(&self, task_id: TaskId) -> Option<&CoordinatorVertex> {
        self.coordinator_vertices
            .iter()
            .find(|v| v.task_id == task_id)
    }

    pub fn task_count(&self) -> usize {
        self.physical_vertices.len() + self.coordinator_vertices.len()
    }

    /// one slot per task group
    pub fn slot_count(&self) -> usize {
        self.task_groups.len()
    }

    pub fn local_inputs_of(&self, vertex_id: VertexId) -> Vec<VertexId> {
        self.internal_edges
            .iter()
            .filter(|e| e.target_vertex_id == vertex_id)
            .map(|e| e.input_vertex_id)
            .collect()
    }

    pub fn blocking_upstream_pipelines(&self) -> BTreeSet<PipelineId> {
        self.upstream
            .iter()
            .filter(|e| e.blocking)
            .map(|e| e.upstream_pipeline)
            .collect()
    }

    /// Every task that has to acknowledge a checkpoint of this pipeline.
    pub fn all_task_ids(&self) -> Vec<TaskId> {
        self.coordinator_vertices
            .iter()
            .map(|v| v.task_id)
            .chain(self.physical_vertices.iter().map(|v| v.task_id))
            .collect()
    }

    pub fn set_location(&mut self, task_id: TaskId, location: TaskLocation) {
        if let Some(v) = self
            .physical_vertices
            .iter_mut()
            .find(|v| v.task_id == task_id)
        {
            v.location = Some(location);
        } else if let Some(v) = self
            .coordinator_vertices
            .iter_mut()
            .find(|v| v.task_id == task_id)
        {
            v.location = Some(location);
        }
    }

    pub fn set_state(&mut self, task_id: TaskId, state: ExecutionState) {
        if let Some(v) = self
            .physical_vertices
            .iter_mut()
            .find(|v| v.task_id == task_id)
        {
            v.state = state;
        } else if let Some(v) = self
            .coordinator_vertices
            .iter_mut()
            .find(|v| v.task_id == task_id)
        {
            v.state = state;
        }
    }

    pub fn state_key_of(&self, task_id: TaskId) -> Option<StateKey> {
        self.physical_vertex(task_id)
            .map(|v| v.state_key())
            .or_else(|| self.coordinator_vertex(task_id).map(|v| v.state_key()))
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PhysicalPlan {
    pub job_id: JobId,
    pub job_mode: JobMode,
    pub init_timestamp: u64,
    pub pipelines: Vec<Pipeline>,
}

impl PhysicalPlan {
    pub fn pipeline(&self, pipeline_id: PipelineId) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.pipeline_id == pipeline_id)
    }

    pub fn pipeline_mut(&mut self, pipeline_id: PipelineId) -> Option<&mut Pipeline> {
        self.pipelines
            .iter_mut()
            .find(|p| p.pipeline_id == pipeline_id)
    }

    pub fn physical_vertex_count(&self) -> usize {
        self.pipelines
            .iter()
            .map(|p| p.physical_vertices.len())
            .sum()
    }

    pub fn coordinator_vertex_count(&self) -> usize {
        self.pipelines
            .iter()
            .map(|p| p.coordinator_vertices.len())
            .sum()
    }
}

pub fn compile(
    dag: &LogicalDag,
    job_info: &JobImmutableInformation,
    init_timestamp: u64,
    id_generator: &IdGenerator,
) -> Result<PhysicalPlan, EngineError> {
    let job_mode = job_info.job_mode()?;
    if dag.vertex_count() == 0 {
        return Err(EngineError::job_definition(
            job_info.job_name.as_str(),
            job_info.job_id,
            "logical dag is empty",
        ));
    }

    let mut pipeline_of: BTreeMap<VertexId, usize> = BTreeMap::new();
    let mut pipelines: Vec<Pipeline> = Vec::new();

    for vertex_id in dag.topological_order() {
        let vertex = dag.vertex(vertex_id).ok_or_else(|| {
            EngineError::Internal(format!("{} missing in logical dag", vertex_id))
        })?;
        if vertex.parallelism == 0 {
            return Err(EngineError::job_definition(
                vertex.name(),
                "parallelism",
                "parallelism must be positive",
            ));
        }

        let inputs = dag.inputs_of(vertex_id);
        let input_pipelines: BTreeSet<usize> =
            inputs.iter().filter_map(|i| pipeline_of.get(i).map(|x| *x)).collect();
        let all_forward = !inputs.is_empty()
            && vertex.input_partitioner == Partitioner::RoundRobin
            && inputs.iter().all(|i| {
                dag.vertex(*i)
                    .map(|v| v.parallelism == vertex.parallelism)
                    .unwrap_or(false)
            });

        let index = if all_forward && input_pipelines.len() == 1 {
            *input_pipelines.iter().next().unwrap_or(&0)
        } else {
            let pipeline_id = PipelineId(pipelines.len() as u32 + 1);
            pipelines.push(Pipeline::new(pipeline_id, vertex.parallelism));
            pipelines.len() - 1
        };

        pipeline_of.insert(vertex_id, index);
        let pipeline = &mut pipelines[index];
        pipeline.vertex_ids.push(vertex_id);
        if vertex.action.requires_coordinator() {
            pipeline.coordinated_vertex_ids.push(vertex_id);
        }
    }

    for edge in dag.edges() {
        let upstream = pipeline_of[&edge.input_vertex_id];
        let downstream = pipeline_of[&edge.target_vertex_id];
        if upstream == downstream {
            pipelines[upstream].internal_edges.push(*edge);
            continue;
        }

        let producer = dag.vertex(edge.input_vertex_id);
        let consumer = dag.vertex(edge.target_vertex_id);
        let (producer, consumer) = match (producer, consumer) {
            (Some(p), Some(c)) => (p, c),
            _ => return Err(EngineError::Internal(format!("dangling {:?}", edge))),
        };
        let boundary = BoundaryEdge {
            edge: *edge,
            upstream_pipeline: pipelines[upstream].pipeline_id,
            downstream_pipeline: pipelines[downstream].pipeline_id,
            producer_parallelism: producer.parallelism,
            partitions: consumer.parallelism,
            partitioner: consumer.input_partitioner.clone(),
            blocking: job_mode == JobMode::Batch,
        };
        pipelines[upstream].downstream.push(boundary.clone());
        pipelines[downstream].upstream.push(boundary);
    }

    for pipeline in pipelines.iter_mut() {
        pipeline.instantiate(id_generator);
    }

    let plan = PhysicalPlan {
        job_id: job_info.job_id,
        job_mode,
        init_timestamp,
        pipelines,
    };
    info!(
        "compile {} to {} pipelines, {} physical vertices and {} coordinator vertices",
        plan.job_id,
        plan.pipelines.len(),
        plan.physical_vertex_count(),
        plan.coordinator_vertex_count()
    );
    Ok(plan)
}
