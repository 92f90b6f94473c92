use std::collections::HashMap;
use std::sync::Arc;

use crate::api::connector::{SinkConnector, SourceConnector, Transform};
use crate::api::properties::Properties;

pub type SourceFactory = Arc<dyn Fn() -> Box<dyn SourceConnector> + Send + Sync>;
pub type TransformFactory =
    Arc<dyn Fn(&Properties) -> anyhow::Result<Box<dyn Transform>> + Send + Sync>;
pub type SinkFactory = Arc<dyn Fn() -> Box<dyn SinkConnector> + Send + Sync>;

/// Plugin name to connector factory lookup used by workers to materialize the actions
/// of a deployed task group.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    sources: HashMap<String, SourceFactory>,
    transforms: HashMap<String, TransformFactory>,
    sinks: HashMap<String, SinkFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        ConnectorRegistry::default()
    }

    pub fn register_source<F>(&mut self, plugin_name: &str, factory: F)
    where
        F: Fn() -> Box<dyn SourceConnector> + Send + Sync + 'static,
    {
        self.sources
            .insert(plugin_name.to_string(), Arc::new(factory));
    }

    pub fn register_transform<F>(&mut self, plugin_name: &str, factory: F)
    where
        F: Fn(&Properties) -> anyhow::Result<Box<dyn Transform>> + Send + Sync + 'static,
    {
        self.transforms
            .insert(plugin_name.to_string(), Arc::new(factory));
    }

    pub fn register_sink<F>(&mut self, plugin_name: &str, factory: F)
    where
        F: Fn() -> Box<dyn SinkConnector> + Send + Sync + 'static,
    {
        self.sinks.insert(plugin_name.to_string(), Arc::new(factory));
    }

    pub fn create_source(
        &self,
        plugin_name: &str,
        config: &Properties,
    ) -> anyhow::Result<Box<dyn SourceConnector>> {
        let factory = self
            .sources
            .get(plugin_name)
            .ok_or_else(|| anyhow!("source plugin `{}` not registered", plugin_name))?;
        let mut source = factory();
        source.prepare(config)?;
        Ok(source)
    }

    pub fn create_transform(
        &self,
        plugin_name: &str,
        config: &Properties,
    ) -> anyhow::Result<Box<dyn Transform>> {
        let factory = self
            .transforms
            .get(plugin_name)
            .ok_or_else(|| anyhow!("transform plugin `{}` not registered", plugin_name))?;
        factory(config)
    }

    pub fn create_sink(
        &self,
        plugin_name: &str,
        config: &Properties,
    ) -> anyhow::Result<Box<dyn SinkConnector>> {
        let factory = self
            .sinks
            .get(plugin_name)
            .ok_or_else(|| anyhow!("sink plugin `{}` not registered", plugin_name))?;
        let mut sink = factory();
        sink.prepare(config)?;
        Ok(sink)
    }

    pub fn contains(&self, plugin_name: &str) -> bool {
        self.sources.contains_key(plugin_name)
            || self.transforms.contains_key(plugin_name)
            || self.sinks.contains_key(plugin_name)
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sources: Vec<&String> = self.sources.keys().collect();
        let mut transforms: Vec<&String> = self.transforms.keys().collect();
        let mut sinks: Vec<&String> = self.sinks.keys().collect();
        sources.sort();
        transforms.sort();
        sinks.sort();
        f.debug_struct("ConnectorRegistry")
            .field("sources", &sources)
            .field("transforms", &transforms)
            .field("sinks", &sinks)
            .finish()
    }
}
