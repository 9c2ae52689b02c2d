//! Worker pool configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of worker slots (units executing at once)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Root under which each handle gets its own stage directory
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Seconds a finished chain stays queryable before its handles are dropped
    #[serde(default = "default_result_expires_secs")]
    pub result_expires_secs: u64,
}

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("plugin-pipeline")
}

fn default_result_expires_secs() -> u64 {
    3600
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            work_dir: default_work_dir(),
            result_expires_secs: default_result_expires_secs(),
        }
    }
}

impl QueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_result_expires_secs(mut self, secs: u64) -> Self {
        self.result_expires_secs = secs;
        self
    }

    pub fn result_expires(&self) -> Duration {
        Duration::from_secs(self.result_expires_secs)
    }
}
