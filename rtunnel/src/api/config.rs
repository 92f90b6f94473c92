use std::path::Path;
use std::str::FromStr;

use crate::api::properties::{Properties, PropertiesError};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum JobMode {
    Batch,
    Streaming,
}

impl FromStr for JobMode {
    type Err = PropertiesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(JobMode::Batch),
            "streaming" => Ok(JobMode::Streaming),
            _ => Err(PropertiesError::Unsupported(s.to_string())),
        }
    }
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobMode::Batch => write!(f, "BATCH"),
            JobMode::Streaming => write!(f, "STREAMING"),
        }
    }
}

/// How splits reach the readers of a source.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum SourceMode {
    /// One global split enumerator assigns splits to every reader.
    Coordinated,
    /// Each reader enumerates the splits of its own subtask.
    Parallel,
}

impl Default for SourceMode {
    fn default() -> Self {
        SourceMode::Coordinated
    }
}

/// Routing of rows across a pipeline boundary.
#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
#[serde(tag = "type", content = "param")]
pub enum Partitioner {
    RoundRobin,
    /// murmur3 hash of the row field at this index
    Hash { field: usize },
}

impl Default for Partitioner {
    fn default() -> Self {
        Partitioner::RoundRobin
    }
}

/// One source, transform or sink block of a job definition.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PluginConfig {
    pub plugin_name: String,
    #[serde(default)]
    pub result_table_name: Option<String>,
    #[serde(default)]
    pub source_table_name: Vec<String>,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub source_mode: SourceMode,
    #[serde(default)]
    pub partitioner: Partitioner,
    #[serde(default)]
    pub properties: Properties,
}

impl PluginConfig {
    pub fn new(plugin_name: &str) -> Self {
        PluginConfig {
            plugin_name: plugin_name.to_string(),
            result_table_name: None,
            source_table_name: Vec::new(),
            parallelism: None,
            source_mode: SourceMode::Coordinated,
            partitioner: Partitioner::RoundRobin,
            properties: Properties::new(),
        }
    }

    pub fn with_result_table(mut self, name: &str) -> Self {
        self.result_table_name = Some(name.to_string());
        self
    }

    pub fn with_source_table(mut self, name: &str) -> Self {
        self.source_table_name.push(name.to_string());
        self
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn with_source_mode(mut self, source_mode: SourceMode) -> Self {
        self.source_mode = source_mode;
        self
    }

    pub fn with_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.set_str(key, value);
        self
    }
}

/// Validated job configuration as handed over by the config loader.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub env: Properties,
    #[serde(default)]
    pub source: Vec<PluginConfig>,
    #[serde(default)]
    pub transform: Vec<PluginConfig>,
    #[serde(default)]
    pub sink: Vec<PluginConfig>,
}

impl JobConfig {
    pub fn new(name: &str) -> Self {
        JobConfig {
            name: name.to_string(),
            env: Properties::new(),
            source: Vec::new(),
            transform: Vec::new(),
            sink: Vec::new(),
        }
    }

    pub fn from_yaml(context: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(context).map_err(|e| anyhow!("parse job config error. {}", e))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let context = crate::utils::fs::read_string(path)
            .map_err(|e| anyhow!("read job config {:?} error. {}", path, e))?;
        Self::from_yaml(context.as_str())
    }
}
