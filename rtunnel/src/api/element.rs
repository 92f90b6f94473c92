use crate::api::checkpoint::CheckpointBarrier;

/// Engine internal row. Connectors translate their native records into it.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Row {
    pub fields: Vec<serde_json::Value>,
}

impl Row {
    pub fn new(fields: Vec<serde_json::Value>) -> Self {
        Row { fields }
    }

    pub fn field(&self, index: usize) -> Option<&serde_json::Value> {
        self.fields.get(index)
    }
}

/// Unit travelling over an intra-pipeline data path.
#[derive(Clone, Debug, PartialEq)]
pub enum Element {
    Record(Row),
    Barrier(CheckpointBarrier),
    /// The producer of this path finished; nothing follows.
    End,
}

impl Element {
    pub fn is_barrier(&self) -> bool {
        match self {
            Element::Barrier(_) => true,
            _ => false,
        }
    }
}
