//! Filter engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Rows fetched per round-trip while scanning a host (default: 500)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep of an idle filter task before it re-checks (default: 60 s)
    #[serde(default = "default_idle_recheck_interval_ms")]
    pub idle_recheck_interval_ms: u64,

    /// Restart delay after the filter task crashed (default: 10 s)
    #[serde(default = "default_task_restart_delay_ms")]
    pub task_restart_delay_ms: u64,

    /// Longest a single callback may take for one batch before it is
    /// removed (default: 5 s)
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_recheck_interval_ms: default_idle_recheck_interval_ms(),
            task_restart_delay_ms: default_task_restart_delay_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl FilterConfig {
    pub fn idle_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.idle_recheck_interval_ms)
    }

    pub fn task_restart_delay(&self) -> Duration {
        Duration::from_millis(self.task_restart_delay_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_idle_recheck_interval_ms() -> u64 {
    60 * 1000
}

fn default_task_restart_delay_ms() -> u64 {
    10 * 1000
}

fn default_delivery_timeout_ms() -> u64 {
    5 * 1000
}
