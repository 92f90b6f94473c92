use crate::api::config::SourceMode;
use crate::api::properties::Properties;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SourceAction {
    pub name: String,
    pub plugin_name: String,
    pub source_mode: SourceMode,
    pub properties: Properties,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TransformAction {
    pub name: String,
    pub plugin_name: String,
    pub properties: Properties,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SinkAction {
    pub name: String,
    pub plugin_name: String,
    pub properties: Properties,
}

/// What a logical vertex does.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum Action {
    Source(SourceAction),
    Transform(TransformAction),
    Sink(SinkAction),
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Action::Source(action) => action.name.as_str(),
            Action::Transform(action) => action.name.as_str(),
            Action::Sink(action) => action.name.as_str(),
        }
    }

    pub fn plugin_name(&self) -> &str {
        match self {
            Action::Source(action) => action.plugin_name.as_str(),
            Action::Transform(action) => action.plugin_name.as_str(),
            Action::Sink(action) => action.plugin_name.as_str(),
        }
    }

    pub fn properties(&self) -> &Properties {
        match self {
            Action::Source(action) => &action.properties,
            Action::Transform(action) => &action.properties,
            Action::Sink(action) => &action.properties,
        }
    }

    pub fn is_source(&self) -> bool {
        match self {
            Action::Source(_) => true,
            _ => false,
        }
    }

    pub fn is_sink(&self) -> bool {
        match self {
            Action::Sink(_) => true,
            _ => false,
        }
    }

    /// A coordinated source needs one global split enumerator instance.
    pub fn requires_coordinator(&self) -> bool {
        match self {
            Action::Source(action) => action.source_mode == SourceMode::Coordinated,
            _ => false,
        }
    }
}
