//! `JobConfig` to `LogicalDag`. Pure: nothing is allocated or submitted here, so a
//! definition error always surfaces before the cluster is touched.

use std::collections::{BTreeMap, BTreeSet};

use crate::api::action::{Action, SinkAction, SourceAction, TransformAction};
use crate::api::config::{JobConfig, PluginConfig};
use crate::api::error::EngineError;
use crate::api::properties::SystemProperties;
use crate::api::runtime::VertexId;
use crate::dag::logical_dag::{LogicalDag, LogicalEdge, LogicalVertex};
use crate::utils::IdGenerator;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PluginType {
    Source,
    Transform,
    Sink,
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginType::Source => write!(f, "source"),
            PluginType::Transform => write!(f, "transform"),
            PluginType::Sink => write!(f, "sink"),
        }
    }
}

struct PluginRef<'a> {
    plugin_type: PluginType,
    index: usize,
    config: &'a PluginConfig,
}

impl<'a> PluginRef<'a> {
    fn name(&self) -> String {
        format!(
            "{}[{}]({})",
            self.plugin_type, self.index, self.config.plugin_name
        )
    }

    fn produces(&self) -> bool {
        self.plugin_type != PluginType::Sink
    }

    fn consumes(&self) -> bool {
        self.plugin_type != PluginType::Source
    }
}

pub fn compile(config: &JobConfig, id_generator: &IdGenerator) -> Result<LogicalDag, EngineError> {
    if config.source.is_empty() || config.sink.is_empty() {
        return Err(EngineError::job_definition(
            config.name.as_str(),
            if config.source.is_empty() {
                "source"
            } else {
                "sink"
            },
            "source and sink can not be empty",
        ));
    }

    let plugins = plugin_refs(config);
    check_table_names(&plugins)?;
    let producers = check_result_tables(&plugins)?;
    check_inputs(&plugins, &producers)?;
    check_orphans(&plugins, &producers)?;

    let default_parallelism = config.env.get_parallelism().map_err(|e| {
        EngineError::job_definition(config.name.as_str(), "parallelism", e.to_string())
    })?;

    let mut dag = LogicalDag::new();
    let mut vertex_ids = Vec::with_capacity(plugins.len());
    for plugin in &plugins {
        let parallelism = plugin.config.parallelism.unwrap_or(default_parallelism);
        if parallelism == 0 {
            return Err(EngineError::job_definition(
                plugin.name(),
                "parallelism",
                "parallelism must be positive",
            ));
        }

        let vertex_id = VertexId(id_generator.next_id());
        let mut vertex = LogicalVertex::new(vertex_id, create_action(plugin), parallelism);
        vertex.input_partitioner = plugin.config.partitioner.clone();
        dag.add_vertex(vertex)?;
        vertex_ids.push(vertex_id);
    }

    for (plugin, vertex_id) in plugins.iter().zip(vertex_ids.iter()) {
        if !plugin.consumes() {
            continue;
        }
        for table in &plugin.config.source_table_name {
            let producer = producers[table.as_str()];
            dag.add_edge(LogicalEdge::new(vertex_ids[producer], *vertex_id))
                .map_err(|_e| {
                    EngineError::job_definition(
                        plugin.name(),
                        table,
                        "input table forms a cycle",
                    )
                })?;
        }
    }

    debug!(
        "compile job `{}` to logical dag with {} vertices and {} edges",
        config.name,
        dag.vertex_count(),
        dag.edges().len()
    );
    Ok(dag)
}

fn plugin_refs(config: &JobConfig) -> Vec<PluginRef> {
    let sources = config.source.iter().enumerate().map(|(index, c)| PluginRef {
        plugin_type: PluginType::Source,
        index,
        config: c,
    });
    let transforms = config
        .transform
        .iter()
        .enumerate()
        .map(|(index, c)| PluginRef {
            plugin_type: PluginType::Transform,
            index,
            config: c,
        });
    let sinks = config.sink.iter().enumerate().map(|(index, c)| PluginRef {
        plugin_type: PluginType::Sink,
        index,
        config: c,
    });
    sources.chain(transforms).chain(sinks).collect()
}

fn check_table_names(plugins: &[PluginRef]) -> Result<(), EngineError> {
    for plugin in plugins.iter().filter(|p| p.produces()) {
        match &plugin.config.result_table_name {
            Some(name) if !name.trim().is_empty() => {}
            _ => {
                return Err(EngineError::job_definition(
                    plugin.name(),
                    "result_table_name",
                    "result table name is missing",
                ))
            }
        }
    }

    for plugin in plugins.iter().filter(|p| p.consumes()) {
        if plugin.config.source_table_name.is_empty()
            || plugin
                .config
                .source_table_name
                .iter()
                .any(|x| x.trim().is_empty())
        {
            return Err(EngineError::job_definition(
                plugin.name(),
                "source_table_name",
                "source table name is missing",
            ));
        }
    }
    Ok(())
}

/// result table name -> position in `plugins`
fn check_result_tables<'a>(
    plugins: &'a [PluginRef<'a>],
) -> Result<BTreeMap<&'a str, usize>, EngineError> {
    let mut producers = BTreeMap::new();
    for (index, plugin) in plugins.iter().enumerate() {
        if let Some(table) = &plugin.config.result_table_name {
            if !plugin.produces() {
                continue;
            }
            if producers.insert(table.as_str(), index).is_some() {
                return Err(EngineError::job_definition(
                    plugin.name(),
                    table,
                    "duplicate result table name",
                ));
            }
        }
    }
    Ok(producers)
}

fn check_inputs(plugins: &[PluginRef], producers: &BTreeMap<&str, usize>) -> Result<(), EngineError> {
    for plugin in plugins.iter().filter(|p| p.consumes()) {
        for table in &plugin.config.source_table_name {
            if !producers.contains_key(table.as_str()) {
                return Err(EngineError::job_definition(
                    plugin.name(),
                    table,
                    "input table is not declared by any source or transform",
                ));
            }
        }
    }
    Ok(())
}

fn check_orphans(plugins: &[PluginRef], producers: &BTreeMap<&str, usize>) -> Result<(), EngineError> {
    let consumed: BTreeSet<&str> = plugins
        .iter()
        .filter(|p| p.consumes())
        .flat_map(|p| p.config.source_table_name.iter().map(|x| x.as_str()))
        .collect();

    for (table, index) in producers {
        if !consumed.contains(table) {
            return Err(EngineError::job_definition(
                plugins[*index].name(),
                table,
                "result table is not consumed by any transform or sink",
            ));
        }
    }
    Ok(())
}

fn create_action(plugin: &PluginRef) -> Action {
    let name = plugin.name();
    let plugin_name = plugin.config.plugin_name.clone();
    let properties = plugin.config.properties.clone();
    match plugin.plugin_type {
        PluginType::Source => Action::Source(SourceAction {
            name,
            plugin_name,
            source_mode: plugin.config.source_mode,
            properties,
        }),
        PluginType::Transform => Action::Transform(TransformAction {
            name,
            plugin_name,
            properties,
        }),
        PluginType::Sink => Action::Sink(SinkAction {
            name,
            plugin_name,
            properties,
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::api::config::{JobConfig, PluginConfig};
    use crate::api::error::EngineError;
    use crate::api::properties::SystemProperties;
    use crate::api::runtime::VertexId;
    use crate::dag::logical_plan::compile;
    use crate::utils::IdGenerator;

    pub(crate) fn source_to_sink(parallelism: u32) -> JobConfig {
        let mut config = JobConfig::new("source-to-sink");
        config.source.push(
            PluginConfig::new("VecSource")
                .with_result_table("fake")
                .with_parallelism(parallelism),
        );
        config.sink.push(
            PluginConfig::new("Print")
                .with_source_table("fake")
                .with_parallelism(parallelism),
        );
        config
    }

    fn assert_definition_error(config: &JobConfig, vertex: &str, identifier: &str) {
        match compile(config, &IdGenerator::new()) {
            Err(EngineError::JobDefinition {
                vertex: v,
                identifier: i,
                ..
            }) => {
                assert_eq!(v, vertex);
                assert_eq!(i, identifier);
            }
            r => panic!("expect job definition error, got {:?}", r),
        }
    }

    #[test]
    pub fn compile_test() {
        let mut config = source_to_sink(3);
        config.env.set_parallelism(2);
        config.transform.push(
            PluginConfig::new("Uppercase")
                .with_source_table("fake")
                .with_result_table("upper"),
        );
        config.sink[0].source_table_name = vec!["upper".to_string()];

        let dag = compile(&config, &IdGenerator::new()).unwrap();
        assert_eq!(dag.vertex_count(), 3);
        assert_eq!(dag.edges().len(), 2);

        // ids follow the source, transform, sink order
        let transform = dag.vertex(VertexId(2)).unwrap();
        assert_eq!(transform.name(), "transform[0](Uppercase)");
        assert_eq!(transform.parallelism, 2);
        assert_eq!(dag.inputs_of(VertexId(3)), vec![VertexId(2)]);
        assert_eq!(dag.vertex(VertexId(1)).unwrap().parallelism, 3);
    }

    #[test]
    pub fn empty_source_or_sink_test() {
        let mut config = source_to_sink(1);
        config.sink.clear();
        assert_definition_error(&config, "source-to-sink", "sink");
    }

    #[test]
    pub fn missing_names_test() {
        let mut config = source_to_sink(1);
        config.source[0].result_table_name = None;
        assert_definition_error(&config, "source[0](VecSource)", "result_table_name");

        let mut config = source_to_sink(1);
        config.sink[0].source_table_name.clear();
        assert_definition_error(&config, "sink[0](Print)", "source_table_name");
    }

    #[test]
    pub fn duplicate_result_table_test() {
        let mut config = source_to_sink(1);
        config
            .source
            .push(PluginConfig::new("VecSource").with_result_table("fake"));
        assert_definition_error(&config, "source[1](VecSource)", "fake");
    }

    #[test]
    pub fn dangling_input_test() {
        let mut config = source_to_sink(1);
        config.sink[0].source_table_name.push("missing".to_string());
        assert_definition_error(&config, "sink[0](Print)", "missing");
    }

    #[test]
    pub fn orphan_result_table_test() {
        let mut config = source_to_sink(1);
        config
            .source
            .push(PluginConfig::new("VecSource").with_result_table("unused"));
        assert_definition_error(&config, "source[1](VecSource)", "unused");
    }

    #[test]
    pub fn cycle_test() {
        let mut config = source_to_sink(1);
        config.transform.push(
            PluginConfig::new("Copy")
                .with_source_table("b")
                .with_result_table("a"),
        );
        config.transform.push(
            PluginConfig::new("Copy")
                .with_source_table("a")
                .with_result_table("b"),
        );
        config.sink[0].source_table_name.push("b".to_string());
        assert_definition_error(&config, "transform[1](Copy)", "a");
    }

    #[test]
    pub fn zero_parallelism_test() {
        let config = source_to_sink(0);
        assert_definition_error(&config, "source[0](VecSource)", "parallelism");
    }
}
