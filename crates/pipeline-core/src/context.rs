//! Execution context handed to work units

use crate::error::UnitError;
use crate::queue::TaskQueue;
use pipeline_common::HandleId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context passed to units during execution
#[derive(Clone)]
pub struct Context {
    /// Handle the unit is executing under
    pub handle_id: HandleId,

    /// Position of the stage inside its chain
    pub stage_index: usize,

    /// Cooperative abort flag for this handle
    cancel: CancellationToken,

    /// Directory reserved for this handle's side effects
    stage_dir: PathBuf,

    /// Queue the unit runs on, for units that submit further work
    queue: Option<Arc<dyn TaskQueue>>,
}

impl Context {
    /// Create a context for a handle with a fresh token and no queue access
    pub fn new(handle_id: HandleId, stage_index: usize) -> Self {
        Self {
            handle_id,
            stage_index,
            cancel: CancellationToken::new(),
            stage_dir: std::env::temp_dir()
                .join("plugin-pipeline")
                .join(handle_id.to_string()),
            queue: None,
        }
    }

    pub fn with_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Place this handle's stage directory under `work_dir`
    pub fn with_work_dir(mut self, work_dir: impl AsRef<Path>) -> Self {
        self.stage_dir = work_dir.as_ref().join(self.handle_id.to_string());
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Yield point: returns `Cancelled` once an abort has been requested
    pub fn checkpoint(&self) -> Result<(), UnitError> {
        if self.cancel.is_cancelled() {
            return Err(UnitError::Cancelled(format!(
                "abort requested for {}",
                self.handle_id
            )));
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when an abort is requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn stage_dir(&self) -> &Path {
        &self.stage_dir
    }

    /// Create the stage directory if needed and return it
    pub async fn ensure_stage_dir(&self) -> Result<&Path, UnitError> {
        tokio::fs::create_dir_all(&self.stage_dir).await?;
        Ok(&self.stage_dir)
    }

    pub fn queue(&self) -> Result<&Arc<dyn TaskQueue>, UnitError> {
        self.queue.as_ref().ok_or_else(|| {
            UnitError::ExecutionFailed("unit requires queue access but none was provided".into())
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("handle_id", &self.handle_id)
            .field("stage_index", &self.stage_index)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("stage_dir", &self.stage_dir)
            .field("has_queue", &self.queue.is_some())
            .finish()
    }
}
