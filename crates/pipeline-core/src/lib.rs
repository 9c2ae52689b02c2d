//! Pipeline Core - work units, chains and the task queue contract
//!
//! This crate provides the abstractions shared by every part of the plugin
//! pipeline: the `WorkUnit` trait implemented by plugins, the unit `Registry`,
//! the `ChainBuilder` that validates stage schemas before anything is queued,
//! and the `TaskQueue` trait the orchestrator drives.

pub mod chain;
pub mod context;
pub mod error;
pub mod queue;
pub mod registry;
pub mod unit;

pub use chain::{BoundStage, ChainBuilder, ChainSpec, PipelineDefinition, StageSpec};
pub use context::Context;
pub use error::{ChainError, QueueError, UnitError};
pub use queue::{Job, TaskQueue};
pub use registry::Registry;
pub use unit::{FieldSpec, PipedValue, UnitConfig, UnitRequest, WorkUnit};

pub use pipeline_common::{ExecutionHandle, HandleId, HandleState, StageError, ValueKind};
