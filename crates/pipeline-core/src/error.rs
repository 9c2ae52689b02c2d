//! Error types for units, chains and the task queue

use pipeline_common::{HandleId, StageError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UnitError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unit execution failed: {0}")]
    ExecutionFailed(String),

    /// Raised when the cooperative cancellation token was observed
    #[error("Unit cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport or status error talking to a plugin server
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl UnitError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Schema mismatch at stage {stage} ({unit}): {reason}")]
    SchemaMismatch {
        stage: usize,
        unit: String,
        reason: String,
    },

    #[error("No unit registered under name: {0}")]
    UnknownUnit(String),

    #[error("Chain has no stages")]
    EmptyChain,

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Unknown handle: {0}")]
    UnknownHandle(HandleId),

    #[error("Timed out after {waited:?} waiting for {id}")]
    Timeout { id: HandleId, waited: Duration },

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("Handle {0} was revoked")]
    Revoked(HandleId),

    #[error("Rejected job: {0}")]
    Rejected(#[from] ChainError),

    #[error("Task queue is shut down")]
    Closed,
}
