//! Pipeline Orchestrator
//!
//! Runs chains of work units on a task queue under a wall-clock timeout.
//! A run queues a watcher unit that submits the chain and returns its handle;
//! this side then polls the chain, and on timeout or cancel cascades abort and
//! revoke signals from the last stage back to the first.

pub mod cascade;
pub mod config;
pub mod error;
pub mod run;
pub mod watcher;

pub use cascade::{cascade, ChainHandles};
pub use config::OrchestratorConfig;
pub use error::{CascadeFailure, CascadeReport, PipelineError};
pub use run::{PipelineRun, RunId, RunOutcome, RunReport, RunStatus, StageStatus, WatchState};
pub use watcher::WatcherUnit;

use pipeline_core::{
    ChainBuilder, ChainSpec, Job, PipelineDefinition, Registry, StageSpec, TaskQueue, ValueKind,
};
use pipeline_memory_queue::MemoryQueue;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use watcher::{ActiveRun, Watcher};

/// Longest a revoked watcher unit is given to record the chain it submitted
const WATCHER_GRACE: Duration = Duration::from_secs(1);

/// Finished runs: recent statuses plus every id seen finishing
#[derive(Default)]
struct History {
    recent: VecDeque<RunStatus>,
    finished: HashSet<RunId>,
}

impl History {
    fn record(&mut self, status: RunStatus, limit: usize) {
        self.finished.insert(status.run_id);
        self.recent.push_back(status);
        while self.recent.len() > limit {
            self.recent.pop_front();
        }
    }
}

/// Runs pipelines and tracks them until they are terminal
pub struct Orchestrator {
    registry: Arc<Registry>,
    queue: Arc<dyn TaskQueue>,
    config: OrchestratorConfig,
    /// One-stage chain running the watcher unit
    watch_chain: ChainSpec,
    runs: Arc<RwLock<HashMap<RunId, Arc<ActiveRun>>>>,
    history: Arc<RwLock<History>>,
}

impl Orchestrator {
    /// Create an orchestrator over an existing queue. `registry` must be the
    /// one the queue executes from and must contain `WatcherUnit`.
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<dyn TaskQueue>,
        config: OrchestratorConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let watch_chain = ChainBuilder::new(&registry, WatcherUnit::NAME)
            .input(ValueKind::Object)
            .stage(StageSpec::new(WatcherUnit::NAME))
            .build()?;

        Ok(Self {
            registry,
            queue,
            config,
            watch_chain,
            runs: Arc::new(RwLock::new(HashMap::with_capacity(16))),
            history: Arc::new(RwLock::new(History::default())),
        })
    }

    /// Create an orchestrator with its own in-process queue. The watcher
    /// unit is registered here.
    pub fn in_process(
        mut registry: Registry,
        config: OrchestratorConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        registry.register(Arc::new(WatcherUnit::new()));
        let registry = Arc::new(registry);
        let queue = MemoryQueue::new(Arc::clone(&registry), config.queue_config());
        Self::new(registry, Arc::new(queue), config)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validate a pipeline definition against this orchestrator's units
    pub fn build_chain(&self, definition: &PipelineDefinition) -> Result<ChainSpec, PipelineError> {
        Ok(definition.build(&self.registry)?)
    }

    /// Queue a run and return without waiting for it
    pub async fn submit_pipeline(
        &self,
        chain: ChainSpec,
        arg: Value,
        timeout: Option<Duration>,
    ) -> Result<PipelineRun, PipelineError> {
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        let pipeline = chain.name().to_string();
        let job = serde_json::to_value(Job::new(chain, arg))
            .map_err(|e| PipelineError::RunTask(format!("could not encode job: {e}")))?;

        let watcher_handle = self
            .queue
            .submit(Job::new(self.watch_chain.clone(), job))
            .await?;

        let run_id = RunId::new();
        let run = Arc::new(ActiveRun::new(run_id, watcher_handle));
        self.runs.write().await.insert(run_id, Arc::clone(&run));

        info!(
            "Run {} ({}) submitted, watcher {}, timeout {:?}",
            run_id, pipeline, watcher_handle, timeout
        );

        let watcher = Watcher {
            queue: Arc::clone(&self.queue),
            run,
            run_id,
            pipeline,
            watcher_handle,
            timeout,
            poll_interval: self.config.poll_interval(),
            grace: WATCHER_GRACE.min(self.config.poll_interval() * 2),
        };

        let runs = Arc::clone(&self.runs);
        let history = Arc::clone(&self.history);
        let history_limit = self.config.history_limit;
        let task = tokio::spawn(async move {
            let report = watcher.run().await;

            if let Some(run) = runs.write().await.remove(&run_id) {
                let status = run.status.read().await.clone();
                history.write().await.record(status, history_limit);
            }
            report
        });

        Ok(PipelineRun::new(run_id, watcher_handle, task))
    }

    /// Run a chain to a terminal state
    pub async fn run_pipeline(
        &self,
        chain: ChainSpec,
        arg: Value,
        timeout: Option<Duration>,
    ) -> Result<RunReport, PipelineError> {
        self.submit_pipeline(chain, arg, timeout).await?.wait().await
    }

    /// Build and run a pipeline definition, honoring its own timeout
    pub async fn run_definition(
        &self,
        definition: &PipelineDefinition,
        arg: Value,
    ) -> Result<RunReport, PipelineError> {
        let chain = self.build_chain(definition)?;
        self.run_pipeline(chain, arg, definition.timeout()).await
    }

    /// Request cancellation of a run. Repeated calls, and calls on finished
    /// runs, are no-ops, even once the run's status has left the history.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), PipelineError> {
        if let Some(run) = self.runs.read().await.get(&run_id) {
            if run.cancel.is_cancelled() {
                debug!("Run {} already cancelling", run_id);
            } else {
                info!("Cancel requested for run {}", run_id);
                run.cancel.cancel();
            }
            return Ok(());
        }

        if self.history.read().await.finished.contains(&run_id) {
            debug!("Run {} already finished, nothing to cancel", run_id);
            Ok(())
        } else {
            Err(PipelineError::UnknownRun(run_id))
        }
    }

    /// Current status of an active or recently finished run
    pub async fn run_status(&self, run_id: RunId) -> Result<RunStatus, PipelineError> {
        if let Some(run) = self.runs.read().await.get(&run_id) {
            return Ok(run.status.read().await.clone());
        }

        self.history
            .read()
            .await
            .recent
            .iter()
            .rev()
            .find(|status| status.run_id == run_id)
            .cloned()
            .ok_or(PipelineError::UnknownRun(run_id))
    }

    /// Runs that have not reached a terminal state
    pub async fn active_runs(&self) -> Vec<RunId> {
        self.runs.read().await.keys().copied().collect()
    }
}
