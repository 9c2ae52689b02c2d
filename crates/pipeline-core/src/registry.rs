//! Unit registry and lookup

use crate::error::ChainError;
use crate::WorkUnit;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of work units, keyed by unit name
pub struct Registry {
    /// All registered units by name
    units: HashMap<String, Arc<dyn WorkUnit>>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            units: HashMap::with_capacity(16),
        }
    }

    /// Register a unit. A later registration under the same name replaces the earlier one.
    pub fn register(&mut self, unit: Arc<dyn WorkUnit>) {
        let name = unit.name().to_string();
        info!("Registering unit: {}", name);

        if self.units.insert(name.clone(), unit).is_some() {
            warn!("Unit '{}' was already registered, replacing it", name);
        }
    }

    /// Get unit by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkUnit>> {
        self.units.get(name).cloned()
    }

    /// Get unit by name or fail with `UnknownUnit`
    pub fn require(&self, name: &str) -> Result<Arc<dyn WorkUnit>, ChainError> {
        self.get(name)
            .ok_or_else(|| ChainError::UnknownUnit(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Registered unit names, sorted
    pub fn unit_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{Context, FieldSpec, UnitConfig, UnitError, UnitRequest};
    use pipeline_common::ValueKind;
    use serde_json::Value;

    // Mock unit for testing
    pub(crate) struct MockUnit {
        pub(crate) config: UnitConfig,
    }

    #[async_trait::async_trait]
    impl WorkUnit for MockUnit {
        fn config(&self) -> &UnitConfig {
            &self.config
        }

        async fn execute(&self, _ctx: &Context, _request: UnitRequest) -> Result<Value, UnitError> {
            Ok(Value::Null)
        }
    }

    pub(crate) fn mock(name: &str, inputs: Vec<FieldSpec>, output: ValueKind) -> Arc<dyn WorkUnit> {
        Arc::new(MockUnit {
            config: UnitConfig::new(name, inputs, output),
        })
    }

    #[test]
    fn test_registry_register_unit() {
        let mut registry = Registry::new();
        registry.register(mock(
            "audio.transcribe",
            vec![FieldSpec::required("input_dir", ValueKind::Path)],
            ValueKind::Text,
        ));

        assert_eq!(registry.len(), 1);
        assert!(registry.get("audio.transcribe").is_some());
        assert!(registry.require("missing").is_err());
    }

    #[test]
    fn test_registry_replaces_duplicate_name() {
        let mut registry = Registry::new();
        registry.register(mock("dup", vec![], ValueKind::Text));
        registry.register(mock("dup", vec![], ValueKind::Integer));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("dup").unwrap().config().output,
            ValueKind::Integer
        );
    }

    #[test]
    fn test_unit_names_sorted() {
        let mut registry = Registry::new();
        registry.register(mock("b", vec![], ValueKind::Any));
        registry.register(mock("a", vec![], ValueKind::Any));
        assert_eq!(registry.unit_names(), vec!["a", "b"]);
    }
}
