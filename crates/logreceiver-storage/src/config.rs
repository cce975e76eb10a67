//! Storage Configuration
//!
//! Controls buffering, flushing and partition lifecycle:
//!
//! - **max_chars_in_buffer**: flush a partition early once its buffer holds
//!   more than this many characters (default: 100 KiB)
//! - **flush_interval_ms**: flush every partition at least this often
//!   (default: 1 s)
//! - **hours_per_partition**: width of a partition bucket, must divide 24
//!   (default: 4)
//! - **default_data_retention_hours**: retention given to new hosts
//!   (default: 7 days, `None` keeps data forever)
//! - **stale_partition_check_interval_ms**: minimum time between evictions
//!   of writers whose bucket has passed (default: 30 min)
//! - **retention_check_interval_ms**: how often the pruner runs (default: 1 h)
//! - **task_restart_delay_ms**: delay before a crashed background task is
//!   restarted (default: 10 s)
//!
//! ## Usage
//!
//! ```ignore
//! let config = StorageConfig {
//!     flush_interval_ms: 250,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Buffered characters per partition before an early flush (default: 100 KiB)
    #[serde(default = "default_max_chars_in_buffer")]
    pub max_chars_in_buffer: usize,

    /// Maximum time between flushes in milliseconds (default: 1 s)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Partition bucket width in hours (default: 4)
    #[serde(default = "default_hours_per_partition")]
    pub hours_per_partition: u32,

    /// Retention assigned to newly registered hosts (default: 168 h)
    #[serde(default = "default_data_retention_hours")]
    pub default_data_retention_hours: Option<u32>,

    /// Minimum interval between stale writer evictions (default: 30 min)
    #[serde(default = "default_stale_partition_check_interval_ms")]
    pub stale_partition_check_interval_ms: u64,

    /// Retention pruner period (default: 1 h)
    #[serde(default = "default_retention_check_interval_ms")]
    pub retention_check_interval_ms: u64,

    /// Restart delay for crashed background tasks (default: 10 s)
    #[serde(default = "default_task_restart_delay_ms")]
    pub task_restart_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_chars_in_buffer: default_max_chars_in_buffer(),
            flush_interval_ms: default_flush_interval_ms(),
            hours_per_partition: default_hours_per_partition(),
            default_data_retention_hours: default_data_retention_hours(),
            stale_partition_check_interval_ms: default_stale_partition_check_interval_ms(),
            retention_check_interval_ms: default_retention_check_interval_ms(),
            task_restart_delay_ms: default_task_restart_delay_ms(),
        }
    }
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn stale_partition_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_partition_check_interval_ms)
    }

    pub fn retention_check_interval(&self) -> Duration {
        Duration::from_millis(self.retention_check_interval_ms)
    }

    pub fn task_restart_delay(&self) -> Duration {
        Duration::from_millis(self.task_restart_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hours_per_partition == 0 || 24 % self.hours_per_partition != 0 {
            return Err(StorageError::InvalidConfig(format!(
                "hours_per_partition must divide 24, got {}",
                self.hours_per_partition
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(StorageError::InvalidConfig(
                "flush_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_chars_in_buffer == 0 {
            return Err(StorageError::InvalidConfig(
                "max_chars_in_buffer must be positive".to_string(),
            ));
        }
        if self.retention_check_interval_ms == 0 {
            return Err(StorageError::InvalidConfig(
                "retention_check_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_chars_in_buffer() -> usize {
    100 * 1024
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_hours_per_partition() -> u32 {
    4
}

fn default_data_retention_hours() -> Option<u32> {
    Some(7 * 24)
}

fn default_stale_partition_check_interval_ms() -> u64 {
    30 * 60 * 1000
}

fn default_retention_check_interval_ms() -> u64 {
    60 * 60 * 1000
}

fn default_task_restart_delay_ms() -> u64 {
    10 * 1000
}
