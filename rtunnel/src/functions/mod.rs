//! In-memory connectors for local runs and tests.

use crate::api::factory::ConnectorRegistry;
use crate::api::properties::Properties;

pub mod sink;
pub mod source;
pub mod transform;

pub const VEC_SOURCE: &str = "VecSource";
pub const COPY_TRANSFORM: &str = "Copy";
pub const UPPERCASE_TRANSFORM: &str = "Uppercase";
pub const PRINT_SINK: &str = "Print";
pub const COLLECT_SINK: &str = "Collect";

/// Registry with every connector of this module.
pub fn default_registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register_source(VEC_SOURCE, || Box::new(source::vec_source::VecSource::default()));
    registry.register_transform(COPY_TRANSFORM, |properties| {
        transform::CopyField::new(properties).map(|t| Box::new(t) as _)
    });
    registry.register_transform(UPPERCASE_TRANSFORM, |properties| {
        transform::Uppercase::new(properties).map(|t| Box::new(t) as _)
    });
    registry.register_sink(PRINT_SINK, || Box::new(sink::print::PrintSink::default()));
    registry.register_sink(COLLECT_SINK, || Box::new(sink::collect::CollectSink::default()));
    registry
}

pub(crate) fn get_u64_or(properties: &Properties, key: &str, default_value: u64) -> anyhow::Result<u64> {
    match properties.get_u64(key) {
        Ok(v) => Ok(v),
        Err(e) if e.is_none() => Ok(default_value),
        Err(e) => Err(anyhow!("property `{}`: {}", key, e)),
    }
}

#[cfg(test)]
mod tests {
    use crate::functions::{default_registry, get_u64_or, COLLECT_SINK, PRINT_SINK, VEC_SOURCE};
    use crate::api::properties::Properties;

    #[test]
    pub fn default_registry_test() {
        let registry = default_registry();
        assert!(registry.contains(VEC_SOURCE));
        assert!(registry.contains(PRINT_SINK));
        assert!(registry.contains(COLLECT_SINK));
        assert!(registry.contains("Uppercase"));
        assert!(!registry.contains("Kafka"));

        assert!(registry
            .create_source("Kafka", &Properties::new())
            .is_err());
    }

    #[test]
    pub fn get_u64_or_test() {
        let mut properties = Properties::new();
        assert_eq!(get_u64_or(&properties, "rows", 7).unwrap(), 7);
        properties.set_str("rows", "12");
        assert_eq!(get_u64_or(&properties, "rows", 7).unwrap(), 12);
        properties.set_str("rows", "-");
        assert!(get_u64_or(&properties, "rows", 7).is_err());
    }
}
