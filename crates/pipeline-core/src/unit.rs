//! Work unit trait and related types

use crate::error::UnitError;
use crate::Context;
use async_trait::async_trait;
use pipeline_common::ValueKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Core unit trait - every queueable operation implements this
#[async_trait]
pub trait WorkUnit: Send + Sync {
    /// Get unit configuration
    fn config(&self) -> &UnitConfig;

    /// Unique unit identifier
    fn name(&self) -> &str {
        &self.config().name
    }

    /// Execute the unit.
    ///
    /// Implementations must call `ctx.checkpoint()` at internal loop
    /// boundaries and confine file writes to `ctx.stage_dir()`. A unit may be
    /// redelivered, so re-running it with the same request must be safe.
    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError>;
}

/// Unit configuration, usually loaded from a YAML manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Unit name
    pub name: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Declared input fields, in binding order
    pub inputs: Vec<FieldSpec>,

    /// Kind of value produced
    pub output: ValueKind,
}

impl UnitConfig {
    pub fn new(name: impl Into<String>, inputs: Vec<FieldSpec>, output: ValueKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            inputs,
            output,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.inputs.iter().find(|f| f.name == name)
    }
}

/// A declared input field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub optional: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
        }
    }
}

/// The previous stage's output (or the chain argument) bound to a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipedValue {
    pub field: String,
    pub value: Value,
}

/// Request passed to unit execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitRequest {
    /// Value handed over from upstream, if the unit takes one
    pub piped: Option<PipedValue>,

    /// Static parameters fixed when the chain was built
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl UnitRequest {
    pub fn new(params: Map<String, Value>) -> Self {
        Self {
            piped: None,
            params,
        }
    }

    pub fn with_piped(mut self, field: impl Into<String>, value: Value) -> Self {
        self.piped = Some(PipedValue {
            field: field.into(),
            value,
        });
        self
    }

    /// Look up a field, preferring the piped binding
    pub fn get(&self, name: &str) -> Option<&Value> {
        match &self.piped {
            Some(piped) if piped.field == name => Some(&piped.value),
            _ => self.params.get(name),
        }
    }

    pub fn require(&self, name: &str) -> Result<&Value, UnitError> {
        self.get(name)
            .ok_or_else(|| UnitError::InvalidInput(format!("missing field '{name}'")))
    }

    pub fn require_str(&self, name: &str) -> Result<&str, UnitError> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| UnitError::InvalidInput(format!("field '{name}' is not a string")))
    }

    pub fn require_f64(&self, name: &str) -> Result<f64, UnitError> {
        self.require(name)?
            .as_f64()
            .ok_or_else(|| UnitError::InvalidInput(format!("field '{name}' is not a number")))
    }

    pub fn require_i64(&self, name: &str) -> Result<i64, UnitError> {
        self.require(name)?
            .as_i64()
            .ok_or_else(|| UnitError::InvalidInput(format!("field '{name}' is not an integer")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_prefers_piped_binding() {
        let mut params = Map::new();
        params.insert("y".to_string(), json!(4));
        let request = UnitRequest::new(params).with_piped("x", json!(2));

        assert_eq!(request.require_i64("x").unwrap(), 2);
        assert_eq!(request.require_i64("y").unwrap(), 4);
        assert!(request.get("z").is_none());
        assert!(matches!(
            request.require_str("y"),
            Err(UnitError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_unit_config_yaml() {
        let yaml = r#"
name: text.summarize
description: Summarize text files
inputs:
  - name: input_dir
    kind: path
  - name: model
    kind: text
    optional: true
output: path
"#;
        let config: UnitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "text.summarize");
        assert_eq!(config.inputs.len(), 2);
        assert!(config.field("model").unwrap().optional);
        assert_eq!(config.output, ValueKind::Path);
    }
}
