//! Pipeline watcher
//!
//! `WatcherUnit` runs on the worker pool like any other unit: it submits the
//! chain it was given and returns the chain handle straight away, so it never
//! holds a worker slot while the chain runs. The polling half, `Watcher`,
//! runs on the caller's side and drives
//! `SUBMITTED -> RUNNING -> {COMPLETED, TIMED_OUT, CANCELLED, FAILED}`.

use crate::cascade::{cascade, revoke_gently, ChainHandles};
use crate::error::CascadeReport;
use crate::run::{RunId, RunOutcome, RunReport, RunStatus, StageStatus, WatchState};
use async_trait::async_trait;
use chrono::Utc;
use pipeline_core::{
    Context, ExecutionHandle, FieldSpec, HandleId, HandleState, Job, QueueError, StageError,
    TaskQueue, UnitConfig, UnitError, UnitRequest, ValueKind, WorkUnit,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unit that submits a chain and returns its handle
pub struct WatcherUnit {
    config: UnitConfig,
}

impl WatcherUnit {
    pub const NAME: &'static str = "pipeline.watch";

    /// Field carrying the serialized `Job`
    pub const JOB_FIELD: &'static str = "job";

    pub fn new() -> Self {
        Self {
            config: UnitConfig::new(
                Self::NAME,
                vec![FieldSpec::required(Self::JOB_FIELD, ValueKind::Object)],
                ValueKind::Object,
            )
            .with_description("Submit a chain and return its handle"),
        }
    }
}

impl Default for WatcherUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkUnit for WatcherUnit {
    fn config(&self) -> &UnitConfig {
        &self.config
    }

    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        let job: Job = serde_json::from_value(request.require(Self::JOB_FIELD)?.clone())?;
        let queue = ctx.queue()?;

        // Last chance to back out; once submitted the handle must be returned.
        ctx.checkpoint()?;

        let chain_handle = queue
            .submit(job)
            .await
            .map_err(|e| UnitError::ExecutionFailed(format!("chain submission failed: {e}")))?;

        info!("Watcher {} submitted chain {}", ctx.handle_id, chain_handle);
        Ok(json!({ "chain_handle": chain_handle }))
    }
}

/// Chain handle recorded in a watcher's result
fn chain_handle_of(handle: &ExecutionHandle) -> Option<HandleId> {
    handle
        .result
        .as_ref()?
        .get("chain_handle")?
        .as_str()?
        .parse()
        .ok()
}

/// Outcome the stages have already reached on their own: FAILED if any
/// stage failed, COMPLETED once the last stage succeeded
fn settled(stages: &[ExecutionHandle]) -> Option<RunOutcome> {
    if let Some(failed) = stages.iter().find(|s| s.state == HandleState::Failure) {
        let error = failed.error.clone().unwrap_or_else(|| StageError {
            unit: failed.unit.clone(),
            stage_index: failed.stage_index,
            message: "stage failed".to_string(),
        });
        return Some(RunOutcome::Failed { error });
    }

    stages
        .last()
        .filter(|s| s.state == HandleState::Success)
        .map(|done| RunOutcome::Completed {
            result: done.result.clone().unwrap_or(Value::Null),
        })
}

/// Orchestrator-side record of a run in flight
pub(crate) struct ActiveRun {
    pub(crate) cancel: CancellationToken,
    pub(crate) status: RwLock<RunStatus>,
}

impl ActiveRun {
    pub(crate) fn new(run_id: RunId, watcher_handle: HandleId) -> Self {
        Self {
            cancel: CancellationToken::new(),
            status: RwLock::new(RunStatus {
                run_id,
                state: WatchState::Submitted,
                watcher_handle,
                chain_handle: None,
                started_at: Utc::now(),
                finished_at: None,
            }),
        }
    }
}

/// How a watch ended, before the stage snapshot is taken
struct Finish {
    outcome: RunOutcome,
    handles: Option<ChainHandles>,
    cascade: Option<CascadeReport>,
}

impl Finish {
    fn new(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            handles: None,
            cascade: None,
        }
    }

    fn with_chain(mut self, handles: ChainHandles, cascade: Option<CascadeReport>) -> Self {
        self.handles = Some(handles);
        self.cascade = cascade;
        self
    }
}

/// Caller-side poller for one run
pub(crate) struct Watcher {
    pub(crate) queue: Arc<dyn TaskQueue>,
    pub(crate) run: Arc<ActiveRun>,
    pub(crate) run_id: RunId,
    pub(crate) pipeline: String,
    pub(crate) watcher_handle: HandleId,
    pub(crate) timeout: Duration,
    pub(crate) poll_interval: Duration,
    /// How long a revoked watcher unit gets to record its chain handle
    pub(crate) grace: Duration,
}

impl Watcher {
    pub(crate) async fn run(self) -> RunReport {
        let started = Instant::now();

        let finish = match self.wait_for_chain(started + self.timeout).await {
            Ok(last) => self.watch_chain(last).await,
            Err(finish) => finish,
        };

        let stages = match &finish.handles {
            Some(handles) => match handles.snapshot(self.queue.as_ref()).await {
                Ok(stages) => stages.iter().map(StageStatus::from).collect(),
                Err(e) => {
                    warn!("Could not snapshot stages of {}: {}", self.run_id, e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let state = finish.outcome.state();
        let chain_handle = finish.handles.as_ref().map(ChainHandles::last);
        {
            let mut status = self.run.status.write().await;
            status.state = state;
            status.chain_handle = chain_handle.or(status.chain_handle);
            status.finished_at = Some(Utc::now());
        }

        info!("Run {} ({}) finished: {}", self.run_id, self.pipeline, state);
        RunReport {
            run_id: self.run_id,
            pipeline: self.pipeline,
            outcome: finish.outcome,
            watcher_handle: self.watcher_handle,
            chain_handle,
            stages,
            cascade: finish.cascade,
            timeout: self.timeout,
            elapsed: started.elapsed(),
        }
    }

    /// SUBMITTED: wait for the watcher unit to hand back the chain handle
    async fn wait_for_chain(&self, deadline: Instant) -> Result<HandleId, Finish> {
        loop {
            match self.queue.get_handle(self.watcher_handle).await {
                Ok(handle) => match handle.state {
                    HandleState::Success => {
                        return chain_handle_of(&handle).ok_or_else(|| {
                            Finish::new(RunOutcome::Failed {
                                error: StageError {
                                    unit: handle.unit.clone(),
                                    stage_index: 0,
                                    message: "watcher returned no chain handle".to_string(),
                                },
                            })
                        });
                    }
                    HandleState::Failure => {
                        let error = handle.error.clone().unwrap_or_else(|| StageError {
                            unit: handle.unit.clone(),
                            stage_index: 0,
                            message: "watcher failed".to_string(),
                        });
                        warn!("Watcher of run {} failed: {}", self.run_id, error);
                        return Err(Finish::new(RunOutcome::Failed { error }));
                    }
                    HandleState::Revoked => {
                        warn!("Watcher of run {} was revoked externally", self.run_id);
                        return Err(self.stop_watcher(RunOutcome::Cancelled).await);
                    }
                    HandleState::Pending | HandleState::Started => {}
                },
                Err(e) => warn!("Polling watcher {} failed: {}", self.watcher_handle, e),
            }

            if self.run.cancel.is_cancelled() {
                info!("Run {} cancelled before its chain started", self.run_id);
                return Err(self.stop_watcher(RunOutcome::Cancelled).await);
            }
            if Instant::now() >= deadline {
                info!("Run {} timed out before its chain started", self.run_id);
                return Err(self.stop_watcher(RunOutcome::TimedOut).await);
            }
            self.pause(deadline).await;
        }
    }

    /// Revoke the watcher unit, then cascade any chain it managed to submit
    async fn stop_watcher(&self, outcome: RunOutcome) -> Finish {
        let mut report = revoke_gently(self.queue.as_ref(), self.watcher_handle).await;

        // A watcher caught mid-submit still records the chain handle it got back
        let waited = self.queue.get_result(self.watcher_handle, self.grace).await;
        if matches!(waited, Err(QueueError::Timeout { .. })) {
            if let Err(e) = self.queue.revoke(self.watcher_handle, true).await {
                warn!("Terminating watcher {} failed: {}", self.watcher_handle, e);
            }
        }

        let submitted = match self.queue.get_handle(self.watcher_handle).await {
            Ok(handle) => chain_handle_of(&handle),
            Err(e) => {
                warn!("Could not read watcher {}: {}", self.watcher_handle, e);
                None
            }
        };

        let Some(last) = submitted else {
            return Finish {
                outcome,
                handles: None,
                cascade: Some(report),
            };
        };

        match ChainHandles::collect(self.queue.as_ref(), last).await {
            Ok(handles) => {
                // The chain may have finished before the stop was noticed
                let reached = match handles.snapshot(self.queue.as_ref()).await {
                    Ok(stages) => settled(&stages),
                    Err(e) => {
                        warn!("Could not snapshot chain {}: {}", last, e);
                        None
                    }
                };
                let outcome = match reached {
                    Some(completed @ RunOutcome::Completed { .. }) => {
                        info!("Chain of run {} had already completed", self.run_id);
                        return Finish::new(completed).with_chain(handles, Some(report));
                    }
                    Some(failed) => failed,
                    None => outcome,
                };
                report.merge(cascade(self.queue.as_ref(), &handles).await);
                Finish::new(outcome).with_chain(handles, Some(report))
            }
            Err(e) => {
                warn!("Could not walk chain {}: {}", last, e);
                Finish {
                    outcome,
                    handles: None,
                    cascade: Some(report),
                }
            }
        }
    }

    /// RUNNING: poll every stage until the chain settles or the deadline passes
    async fn watch_chain(&self, last: HandleId) -> Finish {
        let handles = match ChainHandles::collect(self.queue.as_ref(), last).await {
            Ok(handles) => handles,
            Err(e) => {
                warn!("Could not walk chain {}: {}", last, e);
                ChainHandles::single(last)
            }
        };

        let deadline = self.chain_deadline(last).await;
        {
            let mut status = self.run.status.write().await;
            status.state = WatchState::Running;
            status.chain_handle = Some(last);
        }
        debug!(
            "Run {} watching {} stages, chain handle {}",
            self.run_id,
            handles.len(),
            last
        );

        loop {
            match handles.snapshot(self.queue.as_ref()).await {
                Ok(stages) => match settled(&stages) {
                    Some(RunOutcome::Completed { result }) => {
                        return Finish::new(RunOutcome::Completed { result })
                            .with_chain(handles, None);
                    }
                    Some(outcome) => {
                        if let RunOutcome::Failed { error } = &outcome {
                            warn!("Run {} failed: {}", self.run_id, error);
                        }
                        return self.cascade_with(handles, outcome).await;
                    }
                    None => {
                        if let Some(revoked) =
                            stages.iter().find(|s| s.state == HandleState::Revoked)
                        {
                            warn!(
                                "Stage {} of run {} was revoked",
                                revoked.stage_index, self.run_id
                            );
                            return self.cascade_with(handles, RunOutcome::Cancelled).await;
                        }
                    }
                },
                Err(e) => warn!("Polling chain {} failed: {}", last, e),
            }

            if self.run.cancel.is_cancelled() {
                info!("Run {} cancelled", self.run_id);
                return self.cascade_with(handles, RunOutcome::Cancelled).await;
            }
            if Instant::now() >= deadline {
                info!("Run {} timed out after {:?}", self.run_id, self.timeout);
                return self.cascade_with(handles, RunOutcome::TimedOut).await;
            }
            self.pause(deadline).await;
        }
    }

    async fn cascade_with(&self, handles: ChainHandles, outcome: RunOutcome) -> Finish {
        let report = cascade(self.queue.as_ref(), &handles).await;
        if !report.is_clean() {
            warn!(
                "Cascade for run {} left {} signals undelivered",
                self.run_id,
                report.failures.len()
            );
        }
        Finish::new(outcome).with_chain(handles, Some(report))
    }

    /// Deadline measured from the chain handle's submission time
    async fn chain_deadline(&self, last: HandleId) -> Instant {
        let now = Instant::now();
        match self.queue.get_handle(last).await {
            Ok(handle) => {
                let elapsed = (Utc::now() - handle.submitted_at)
                    .to_std()
                    .unwrap_or_default();
                now + self.timeout.saturating_sub(elapsed)
            }
            Err(e) => {
                warn!("Could not read chain handle {}: {}", last, e);
                now + self.timeout
            }
        }
    }

    /// Sleep one poll interval, waking early on cancel or at the deadline
    async fn pause(&self, deadline: Instant) {
        let wake = (Instant::now() + self.poll_interval).min(deadline);
        tokio::select! {
            _ = self.run.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
