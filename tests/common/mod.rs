//! Shared setup for the end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use plugin_pipeline::pipeline_units::builtin_registry;
use plugin_pipeline::{
    ChainBuilder, ChainSpec, Context, MemoryQueue, Orchestrator, OrchestratorConfig, Registry,
    StageSpec, UnitError, ValueKind, WatcherUnit, WorkUnit,
};
use plugin_pipeline::pipeline_core::{FieldSpec, UnitConfig, UnitRequest};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Passes its input through and counts how often it ran
pub struct CountingUnit {
    config: UnitConfig,
    runs: Arc<AtomicUsize>,
}

impl CountingUnit {
    pub const NAME: &'static str = "test.count";

    pub fn new(runs: Arc<AtomicUsize>) -> Self {
        Self {
            config: UnitConfig::new(
                Self::NAME,
                vec![FieldSpec::required("value", ValueKind::Any)],
                ValueKind::Any,
            ),
            runs,
        }
    }
}

#[async_trait]
impl WorkUnit for CountingUnit {
    fn config(&self) -> &UnitConfig {
        &self.config
    }

    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        ctx.checkpoint()?;
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(request.require("value")?.clone())
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub queue: MemoryQueue,
    pub registry: Arc<Registry>,
    /// Runs of `test.count`
    pub counted: Arc<AtomicUsize>,
    _work_dir: TempDir,
}

impl Harness {
    pub fn new(workers: usize) -> Self {
        Self::with_poll_interval(workers, 50)
    }

    pub fn with_poll_interval(workers: usize, poll_interval_ms: u64) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let counted = Arc::new(AtomicUsize::new(0));

        let mut registry = builtin_registry();
        registry.register(Arc::new(WatcherUnit::new()));
        registry.register(Arc::new(CountingUnit::new(Arc::clone(&counted))));
        let registry = Arc::new(registry);

        let config = OrchestratorConfig {
            poll_interval_ms,
            workers,
            work_dir: work_dir.path().to_path_buf(),
            ..OrchestratorConfig::default()
        };
        let queue = MemoryQueue::new(Arc::clone(&registry), config.queue_config());
        let orchestrator =
            Orchestrator::new(Arc::clone(&registry), Arc::new(queue.clone()), config).unwrap();

        Self {
            orchestrator,
            queue,
            registry,
            counted,
            _work_dir: work_dir,
        }
    }

    pub fn chain(&self, input: ValueKind, stages: Vec<StageSpec>) -> ChainSpec {
        ChainBuilder::new(&self.registry, "e2e")
            .input(input)
            .stages(stages)
            .build()
            .unwrap()
    }
}

pub fn stage(unit: &str) -> StageSpec {
    StageSpec::new(unit)
}

pub fn secs(seconds: u64) -> Option<Duration> {
    Some(Duration::from_secs(seconds))
}
