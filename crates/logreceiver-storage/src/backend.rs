//! Log Storage Backends
//!
//! [`LogBackend`] is the seam between the buffering engine and the database.
//! The engine decides *when* rows are written; a backend only knows *how*.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`PostgresLogBackend`](crate::PostgresLogBackend) | production, COPY into range partitions |
//! | [`InMemoryLogBackend`](crate::InMemoryLogBackend) | tests and local development |
//!
//! ## Reading
//!
//! All reads are keyset-paginated on `entry_id`, never on timestamps:
//! timestamps are neither unique nor monotonic across out-of-order UDP
//! delivery, entry IDs are both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logreceiver_core::{Host, SyslogMessage};

use crate::error::Result;
use crate::partition::PartitionSpec;

/// Paging direction relative to the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending entry IDs, newer than the anchor
    Forward,
    /// Descending entry IDs, older than the anchor
    Backward,
}

/// One page of rows from a host's table.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub direction: Direction,

    /// Exclusive entry ID bound (`>` forward, `<` backward)
    pub entry_id: Option<i64>,

    /// Timestamp bound (`log_ts >=` forward, `log_ts <` backward)
    pub timestamp: Option<DateTime<Utc>>,

    pub limit: usize,
}

impl PageRequest {
    /// The newest `limit` rows, newest first.
    pub fn latest(limit: usize) -> Self {
        Self {
            direction: Direction::Backward,
            entry_id: None,
            timestamp: None,
            limit,
        }
    }

    /// Up to `limit` rows with `entry_id > after_id`, oldest first.
    pub fn after(after_id: i64, limit: usize) -> Self {
        Self {
            direction: Direction::Forward,
            entry_id: Some(after_id),
            timestamp: None,
            limit,
        }
    }
}

#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Creates the host's parent table (if missing) and the partition.
    async fn ensure_partition(&self, host: &Host, partition: &PartitionSpec) -> Result<()>;

    /// Bulk-inserts newline-separated rows into the partition.
    ///
    /// Rows must be committed in the given order so entry IDs follow it.
    async fn copy_rows(&self, host: &Host, partition: &PartitionSpec, rows: &str) -> Result<u64>;

    /// Names of all child tables of the host's parent table.
    async fn list_partitions(&self, host: &Host) -> Result<Vec<String>>;

    async fn drop_partition(&self, host: &Host, table: &str) -> Result<()>;

    /// Highest entry ID stored for the host, `None` if there are no rows.
    async fn latest_entry_id(&self, host: &Host) -> Result<Option<i64>>;

    async fn fetch_page(&self, host: &Host, request: &PageRequest) -> Result<Vec<SyslogMessage>>;

    /// Up to `limit` rows newer than `after_id`, in ascending ID order.
    async fn fetch_after(
        &self,
        host: &Host,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SyslogMessage>> {
        self.fetch_page(host, &PageRequest::after(after_id, limit))
            .await
    }
}
