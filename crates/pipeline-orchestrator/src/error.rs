//! Orchestrator errors and cascade reports

use crate::run::RunId;
use pipeline_core::{ChainError, HandleId, QueueError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A signal the cascade could not deliver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeFailure {
    pub handle: HandleId,
    pub error: String,
}

/// What a cascade touched, from last stage to first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeReport {
    pub visited: Vec<HandleId>,
    pub failures: Vec<CascadeFailure>,
}

impl CascadeReport {
    /// Every abort and revoke was accepted
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn merge(&mut self, other: CascadeReport) {
        self.visited.extend(other.visited);
        self.failures.extend(other.failures);
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(#[from] ChainError),

    #[error("Stage {stage_index} ({unit}) failed: {error}")]
    StageExecution {
        stage_index: usize,
        unit: String,
        error: String,
    },

    #[error("Pipeline timed out after {timeout:?}")]
    Timeout {
        timeout: Duration,
        cascade: CascadeReport,
    },

    #[error("Pipeline was cancelled")]
    Cancelled { cascade: CascadeReport },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Unknown run: {0}")]
    UnknownRun(RunId),

    #[error("Run task failed: {0}")]
    RunTask(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(e.to_string())
    }
}
