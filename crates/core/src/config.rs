use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for the worker pool and the background pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum step executions running at once in the worker pool
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_retry_poll_interval")]
    pub retry_poll_interval_secs: u64,

    #[serde(default = "default_timeout_check_interval")]
    pub timeout_check_interval_secs: u64,
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_retry_poll_interval() -> u64 {
    5
}

fn default_timeout_check_interval() -> u64 {
    15
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            retry_poll_interval_secs: default_retry_poll_interval(),
            timeout_check_interval_secs: default_timeout_check_interval(),
        }
    }
}

impl EngineConfig {
    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.retry_poll_interval_secs.max(1))
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_check_interval_secs.max(1))
    }
}
