//! Run identifiers, states and reports

use crate::error::{CascadeReport, PipelineError};
use chrono::{DateTime, Utc};
use pipeline_core::{ExecutionHandle, HandleId, HandleState, StageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Identifier of one `run_pipeline` / `submit_pipeline` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.strip_prefix("run-").unwrap_or(s)).map(Self)
    }
}

/// Watcher state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchState {
    /// Watcher unit queued, chain not yet submitted
    Submitted,
    /// Chain submitted and being polled
    Running,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl WatchState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Submitted | Self::Running)
    }
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { result: Value },
    TimedOut,
    Cancelled,
    Failed { error: StageError },
}

impl RunOutcome {
    pub fn state(&self) -> WatchState {
        match self {
            Self::Completed { .. } => WatchState::Completed,
            Self::TimedOut => WatchState::TimedOut,
            Self::Cancelled => WatchState::Cancelled,
            Self::Failed { .. } => WatchState::Failed,
        }
    }
}

/// One stage as seen when the run finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub id: HandleId,
    pub unit: String,
    pub stage_index: usize,
    pub state: HandleState,
}

impl From<&ExecutionHandle> for StageStatus {
    fn from(handle: &ExecutionHandle) -> Self {
        Self {
            id: handle.id,
            unit: handle.unit.clone(),
            stage_index: handle.stage_index,
            state: handle.state,
        }
    }
}

/// Live or historical view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: WatchState,
    pub watcher_handle: HandleId,
    pub chain_handle: Option<HandleId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Final report of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub watcher_handle: HandleId,
    pub chain_handle: Option<HandleId>,
    /// Every stage, first to last
    pub stages: Vec<StageStatus>,
    /// Set when a cascade ran
    pub cascade: Option<CascadeReport>,
    pub timeout: Duration,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn state(&self) -> WatchState {
        self.outcome.state()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed { .. })
    }

    /// The final result, or the error describing why there is none
    pub fn into_result(self) -> Result<Value, PipelineError> {
        let cascade = self.cascade.unwrap_or_default();
        match self.outcome {
            RunOutcome::Completed { result } => Ok(result),
            RunOutcome::TimedOut => Err(PipelineError::Timeout {
                timeout: self.timeout,
                cascade,
            }),
            RunOutcome::Cancelled => Err(PipelineError::Cancelled { cascade }),
            RunOutcome::Failed { error } => Err(PipelineError::StageExecution {
                stage_index: error.stage_index,
                unit: error.unit,
                error: error.message,
            }),
        }
    }
}

/// A submitted run whose report can be awaited
#[derive(Debug)]
pub struct PipelineRun {
    id: RunId,
    watcher_handle: HandleId,
    task: JoinHandle<RunReport>,
}

impl PipelineRun {
    pub(crate) fn new(id: RunId, watcher_handle: HandleId, task: JoinHandle<RunReport>) -> Self {
        Self {
            id,
            watcher_handle,
            task,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn watcher_handle(&self) -> HandleId {
        self.watcher_handle
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<RunReport, PipelineError> {
        self.task
            .await
            .map_err(|e| PipelineError::RunTask(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: RunId::new(),
            pipeline: "p".to_string(),
            outcome,
            watcher_handle: HandleId::new(),
            chain_handle: None,
            stages: Vec::new(),
            cascade: None,
            timeout: Duration::from_secs(1),
            elapsed: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::new();
        assert_eq!(id.to_string().parse::<RunId>().unwrap(), id);
    }

    #[test]
    fn test_terminal_watch_states() {
        assert!(!WatchState::Submitted.is_terminal());
        assert!(!WatchState::Running.is_terminal());
        assert!(WatchState::TimedOut.is_terminal());
        assert_eq!(WatchState::TimedOut.to_string(), "TIMED_OUT");
    }

    #[test]
    fn test_into_result() {
        let ok = report(RunOutcome::Completed { result: json!(6) });
        assert_eq!(ok.into_result().unwrap(), json!(6));

        let timed_out = report(RunOutcome::TimedOut);
        assert!(matches!(
            timed_out.into_result(),
            Err(PipelineError::Timeout { .. })
        ));

        let failed = report(RunOutcome::Failed {
            error: StageError {
                unit: "util.fail".to_string(),
                stage_index: 1,
                message: "boom".to_string(),
            },
        });
        match failed.into_result() {
            Err(PipelineError::StageExecution { stage_index, unit, .. }) => {
                assert_eq!(stage_index, 1);
                assert_eq!(unit, "util.fail");
            }
            other => panic!("expected stage failure, got {other:?}"),
        }
    }

    #[test]
    fn test_report_serializes_outcome_tag() {
        let value = serde_json::to_value(report(RunOutcome::Cancelled)).unwrap();
        assert_eq!(value["outcome"], json!("cancelled"));
    }
}
