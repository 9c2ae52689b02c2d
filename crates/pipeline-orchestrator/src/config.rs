//! Orchestrator configuration

use crate::error::PipelineError;
use pipeline_memory_queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Interval between two looks at a running chain
    pub poll_interval_ms: u64,

    /// Timeout for runs that do not set their own
    pub default_timeout_secs: u64,

    /// Worker slots of the in-process queue
    pub workers: usize,

    /// Root of the per-handle stage directories
    pub work_dir: PathBuf,

    /// Finished runs kept for `run_status`
    pub history_limit: usize,

    /// Seconds the queue keeps the handles of a finished chain
    pub result_expires_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            poll_interval_ms: 1000,
            default_timeout_secs: 50,
            workers: queue.workers,
            work_dir: queue.work_dir,
            history_limit: 256,
            result_expires_secs: queue.result_expires_secs,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.poll_interval_ms == 0 {
            return Err(PipelineError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.result_expires_secs.saturating_mul(1000) <= self.poll_interval_ms {
            return Err(PipelineError::Config(
                "result_expires_secs must outlast one poll interval".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config(
                "workers must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_workers(self.workers)
            .with_work_dir(&self.work_dir)
            .with_result_expires_secs(self.result_expires_secs)
    }
}
