//! Task queue contract consumed by the orchestrator
//!
//! The queue owns every execution record. The orchestrator only ever talks to
//! it through this trait, so a broker-backed queue and the in-process queue
//! are interchangeable.

use crate::chain::ChainSpec;
use crate::error::QueueError;
use async_trait::async_trait;
use pipeline_common::{ExecutionHandle, HandleId, HandleState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A chain plus its initial argument, ready to be submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub chain: ChainSpec,
    pub arg: Value,
}

impl Job {
    pub fn new(chain: ChainSpec, arg: Value) -> Self {
        Self { chain, arg }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue a job without waiting for it. Returns the handle of the last
    /// stage; earlier stages are reachable through `get_parent`.
    async fn submit(&self, job: Job) -> Result<HandleId, QueueError>;

    async fn get_state(&self, id: HandleId) -> Result<HandleState, QueueError>;

    /// Wait up to `timeout` for a result. Must only be called from outside
    /// the worker pool.
    async fn get_result(&self, id: HandleId, timeout: Duration) -> Result<Value, QueueError>;

    async fn get_parent(&self, id: HandleId) -> Result<Option<HandleId>, QueueError>;

    /// Full snapshot of a handle
    async fn get_handle(&self, id: HandleId) -> Result<ExecutionHandle, QueueError>;

    /// Remove from the pending queue, or stop a running unit when
    /// `terminate` is set. No-op on terminal handles.
    async fn revoke(&self, id: HandleId, terminate: bool) -> Result<(), QueueError>;

    /// Raise the cooperative abort flag. No-op on terminal handles.
    async fn abort(&self, id: HandleId) -> Result<(), QueueError>;
}
