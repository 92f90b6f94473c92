use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::TryFrom;

use daggy::{Dag, NodeIndex, Walker};

use crate::api::action::Action;
use crate::api::config::Partitioner;
use crate::api::error::EngineError;
use crate::api::runtime::VertexId;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct LogicalVertex {
    pub vertex_id: VertexId,
    pub action: Action,
    pub parallelism: u32,
    /// how rows reach this vertex when its inputs live in another pipeline
    pub input_partitioner: Partitioner,
}

impl LogicalVertex {
    pub fn new(vertex_id: VertexId, action: Action, parallelism: u32) -> Self {
        LogicalVertex {
            vertex_id,
            action,
            parallelism,
            input_partitioner: Partitioner::RoundRobin,
        }
    }

    pub fn name(&self) -> &str {
        self.action.name()
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LogicalEdge {
    pub input_vertex_id: VertexId,
    pub target_vertex_id: VertexId,
}

impl LogicalEdge {
    pub fn new(input_vertex_id: VertexId, target_vertex_id: VertexId) -> Self {
        LogicalEdge {
            input_vertex_id,
            target_vertex_id,
        }
    }
}

/// Plain form of a [`LogicalDag`] used on the wire; converting back re-validates it.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct JsonLogicalDag {
    vertices: Vec<LogicalVertex>,
    edges: Vec<LogicalEdge>,
}

/// Topology of source, transform and sink actions. Vertices and edges can only be added,
/// and an edge is refused when it references an unknown vertex or closes a cycle.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(try_from = "JsonLogicalDag", into = "JsonLogicalDag")]
pub struct LogicalDag {
    vertices: BTreeMap<VertexId, LogicalVertex>,
    edges: Vec<LogicalEdge>,
    node_indies: HashMap<VertexId, NodeIndex>,
    dag: Dag<VertexId, ()>,
}

impl LogicalDag {
    pub fn new() -> Self {
        LogicalDag {
            vertices: BTreeMap::new(),
            edges: Vec::new(),
            node_indies: HashMap::new(),
            dag: Dag::new(),
        }
    }

    pub fn add_vertex(&mut self, vertex: LogicalVertex) -> Result<(), EngineError> {
        if self.vertices.contains_key(&vertex.vertex_id) {
            return Err(EngineError::job_definition(
                vertex.name(),
                vertex.vertex_id,
                "duplicate vertex id",
            ));
        }

        let node_index = self.dag.add_node(vertex.vertex_id);
        self.node_indies.insert(vertex.vertex_id, node_index);
        self.vertices.insert(vertex.vertex_id, vertex);
        Ok(())
    }

    pub fn add_edge(&mut self, edge: LogicalEdge) -> Result<(), EngineError> {
        let input = self.node_index(edge.input_vertex_id, edge.target_vertex_id)?;
        let target = self.node_index(edge.target_vertex_id, edge.input_vertex_id)?;
        if self.edges.contains(&edge) {
            return Ok(());
        }

        self.dag.add_edge(input, target, ()).map_err(|_e| {
            EngineError::job_definition(
                self.vertex_name(edge.target_vertex_id),
                edge.input_vertex_id,
                "edge would create a cycle",
            )
        })?;
        self.edges.push(edge);
        Ok(())
    }

    fn node_index(&self, vertex_id: VertexId, peer: VertexId) -> Result<NodeIndex, EngineError> {
        self.node_indies.get(&vertex_id).map(|x| *x).ok_or_else(|| {
            EngineError::job_definition(
                self.vertex_name(peer),
                vertex_id,
                "edge references a vertex not in the dag",
            )
        })
    }

    fn vertex_name(&self, vertex_id: VertexId) -> String {
        self.vertices
            .get(&vertex_id)
            .map(|v| v.name().to_string())
            .unwrap_or(vertex_id.to_string())
    }

    pub fn vertex(&self, vertex_id: VertexId) -> Option<&LogicalVertex> {
        self.vertices.get(&vertex_id)
    }

    pub fn vertices(&self) -> impl Iterator<Item = &LogicalVertex> {
        self.vertices.values()
    }

    pub fn edges(&self) -> &[LogicalEdge] {
        self.edges.as_slice()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn inputs_of(&self, vertex_id: VertexId) -> Vec<VertexId> {
        self.walk(vertex_id, true)
    }

    pub fn outputs_of(&self, vertex_id: VertexId) -> Vec<VertexId> {
        self.walk(vertex_id, false)
    }

    fn walk(&self, vertex_id: VertexId, parents: bool) -> Vec<VertexId> {
        let node_index = match self.node_indies.get(&vertex_id) {
            Some(node_index) => *node_index,
            None => return vec![],
        };

        let mut ids: Vec<VertexId> = if parents {
            self.dag
                .parents(node_index)
                .iter(&self.dag)
                .map(|(_edge_index, node_index)| self.dag[node_index])
                .collect()
        } else {
            self.dag
                .children(node_index)
                .iter(&self.dag)
                .map(|(_edge_index, node_index)| self.dag[node_index])
                .collect()
        };
        ids.sort();
        ids
    }

    /// Kahn order; ties broken by the smaller vertex id so the order is repeatable.
    pub fn topological_order(&self) -> Vec<VertexId> {
        let mut in_degree: BTreeMap<VertexId, usize> =
            self.vertices.keys().map(|id| (*id, 0usize)).collect();
        for edge in &self.edges {
            if let Some(n) = in_degree.get_mut(&edge.target_vertex_id) {
                *n += 1;
            }
        }

        let mut ready: BTreeSet<VertexId> = in_degree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.vertices.len());
        while let Some(vertex_id) = ready.iter().next().map(|x| *x) {
            ready.remove(&vertex_id);
            order.push(vertex_id);
            for output in self.outputs_of(vertex_id) {
                if let Some(n) = in_degree.get_mut(&output) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(output);
                    }
                }
            }
        }

        order
    }
}

impl Default for LogicalDag {
    fn default() -> Self {
        LogicalDag::new()
    }
}

impl TryFrom<JsonLogicalDag> for LogicalDag {
    type Error = EngineError;

    fn try_from(value: JsonLogicalDag) -> Result<Self, Self::Error> {
        let mut dag = LogicalDag::new();
        for vertex in value.vertices {
            dag.add_vertex(vertex)?;
        }
        for edge in value.edges {
            dag.add_edge(edge)?;
        }
        Ok(dag)
    }
}

impl From<LogicalDag> for JsonLogicalDag {
    fn from(dag: LogicalDag) -> Self {
        JsonLogicalDag {
            vertices: dag.vertices.into_iter().map(|(_, v)| v).collect(),
            edges: dag.edges,
        }
    }
}
