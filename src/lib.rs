//! Plugin Pipeline
//!
//! Cancellable chains of plugin work units. Re-exports the workspace crates
//! under one roof for applications and the end-to-end tests.

pub use pipeline_common;
pub use pipeline_core;
pub use pipeline_memory_queue;
pub use pipeline_orchestrator;
pub use pipeline_units;

pub use pipeline_core::{
    ChainBuilder, ChainError, ChainSpec, Context, ExecutionHandle, HandleId, HandleState, Job,
    PipelineDefinition, QueueError, Registry, StageSpec, TaskQueue, UnitError, ValueKind,
    WorkUnit,
};
pub use pipeline_memory_queue::{MemoryQueue, QueueConfig};
pub use pipeline_orchestrator::{
    Orchestrator, OrchestratorConfig, PipelineError, PipelineRun, RunId, RunOutcome, RunReport,
    WatchState, WatcherUnit,
};
