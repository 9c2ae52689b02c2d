//! Chain specifications and the build-time schema check
//!
//! A chain is a strictly sequential list of units where each stage receives
//! the previous stage's output. Schemas are checked once, when the chain is
//! built, so a mismatch never reaches the queue.

use crate::error::ChainError;
use crate::{Registry, UnitConfig, UnitRequest};
use pipeline_common::ValueKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// A stage as written in a pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Registered unit name
    pub unit: String,

    /// Static parameters for this stage
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl StageSpec {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// A validated stage with its piped field resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundStage {
    pub unit: String,
    pub params: Map<String, Value>,
    /// Field receiving the upstream value
    pub piped_field: String,
    /// Kind produced by this stage
    pub output: ValueKind,
}

impl BoundStage {
    /// Build the request for this stage given the upstream value
    pub fn request(&self, piped: Value) -> UnitRequest {
        UnitRequest::new(self.params.clone()).with_piped(self.piped_field.clone(), piped)
    }
}

/// An immutable, validated chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    name: String,
    input: ValueKind,
    stages: Vec<BoundStage>,
}

impl ChainSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of the initial argument
    pub fn input(&self) -> ValueKind {
        self.input
    }

    pub fn stages(&self) -> &[BoundStage] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&BoundStage> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Kind produced by the final stage
    pub fn output(&self) -> ValueKind {
        self.stages
            .last()
            .map_or(ValueKind::Any, |stage| stage.output)
    }

    /// Piped field of every stage, in order
    pub fn bindings(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.piped_field.as_str()).collect()
    }
}

/// Builds a `ChainSpec` against the units of a registry
pub struct ChainBuilder<'a> {
    registry: &'a Registry,
    name: String,
    input: ValueKind,
    stages: Vec<StageSpec>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(registry: &'a Registry, name: impl Into<String>) -> Self {
        Self {
            registry,
            name: name.into(),
            input: ValueKind::Any,
            stages: Vec::with_capacity(4),
        }
    }

    /// Declare the kind of the chain's initial argument
    pub fn input(mut self, kind: ValueKind) -> Self {
        self.input = kind;
        self
    }

    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(mut self, stages: impl IntoIterator<Item = StageSpec>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Validate every stage and produce the chain
    pub fn build(self) -> Result<ChainSpec, ChainError> {
        if self.stages.is_empty() {
            return Err(ChainError::EmptyChain);
        }

        let mut bound = Vec::with_capacity(self.stages.len());
        let mut piped_kind = self.input;

        for (index, stage) in self.stages.into_iter().enumerate() {
            let unit = self.registry.require(&stage.unit)?;
            let stage = bind_stage(index, unit.config(), stage, piped_kind)?;
            debug!(
                "Stage {} ({}) binds {} <- {}",
                index, stage.unit, stage.piped_field, piped_kind
            );
            piped_kind = stage.output;
            bound.push(stage);
        }

        Ok(ChainSpec {
            name: self.name,
            input: self.input,
            stages: bound,
        })
    }
}

/// Check one stage's params and choose the field that receives the piped value
fn bind_stage(
    index: usize,
    config: &UnitConfig,
    stage: StageSpec,
    piped_kind: ValueKind,
) -> Result<BoundStage, ChainError> {
    let mismatch = |reason: String| ChainError::SchemaMismatch {
        stage: index,
        unit: config.name.clone(),
        reason,
    };

    for (name, value) in &stage.params {
        let field = config
            .field(name)
            .ok_or_else(|| mismatch(format!("unknown parameter '{name}'")))?;
        if !field.kind.matches(value) {
            return Err(mismatch(format!(
                "parameter '{name}' expects {}, got {}",
                field.kind,
                ValueKind::of(value)
            )));
        }
    }

    let mut unbound = config
        .inputs
        .iter()
        .filter(|f| !stage.params.contains_key(&f.name));

    let piped = unbound.next().ok_or_else(|| {
        mismatch("no input field left to receive the upstream value".to_string())
    })?;

    if !piped.kind.accepts(piped_kind) {
        return Err(mismatch(format!(
            "field '{}' expects {}, upstream produces {}",
            piped.name, piped.kind, piped_kind
        )));
    }

    if let Some(missing) = unbound.find(|f| !f.optional) {
        return Err(mismatch(format!(
            "required field '{}' is not provided",
            missing.name
        )));
    }

    Ok(BoundStage {
        unit: stage.unit,
        params: stage.params,
        piped_field: piped.name.clone(),
        output: config.output,
    })
}

/// A pipeline as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,

    /// Kind of the initial argument
    #[serde(default = "default_input_kind")]
    pub input: ValueKind,

    /// Overrides the orchestrator's default timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    pub stages: Vec<StageSpec>,
}

fn default_input_kind() -> ValueKind {
    ValueKind::Any
}

impl PipelineDefinition {
    pub fn from_yaml(contents: &str) -> Result<Self, ChainError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Validate against `registry` and produce the chain
    pub fn build(&self, registry: &Registry) -> Result<ChainSpec, ChainError> {
        ChainBuilder::new(registry, self.name.clone())
            .input(self.input)
            .stages(self.stages.iter().cloned())
            .build()
    }
}
