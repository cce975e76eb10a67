//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Resource Errors
//! - `DatabaseError`: creating a partition or running a bulk insert failed.
//!   The affected rows stay buffered (flush) or the message is lost (store).
//! - `WriterClosed`: the partition writer was evicted or shut down while a
//!   message was being routed to it
//!
//! ### Invariant Violations
//! - `HostMismatch`: a row was routed to, or read from, another host's table
//! - `OutsideInterval`: a message landed in a partition whose interval does
//!   not contain its timestamp
//!
//! These indicate a logic bug, never bad input, and are surfaced as hard
//! failures of the operation.
//!
//! ### Format Errors
//! - `InvalidPartitionName`, `InvalidRow`: stored data that cannot be read back

use chrono::{DateTime, FixedOffset};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Metadata error: {0}")]
    MetadataError(#[from] logreceiver_metadata::MetadataError),

    #[error("Host mismatch: expected host {expected}, got {actual}")]
    HostMismatch { expected: i64, actual: i64 },

    #[error("Timestamp {timestamp} is outside of partition {partition}")]
    OutsideInterval {
        timestamp: DateTime<FixedOffset>,
        partition: String,
    },

    #[error("Partition writer closed: {0}")]
    WriterClosed(String),

    #[error("Invalid partition name: {0}")]
    InvalidPartitionName(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    CoreError(#[from] logreceiver_core::Error),
}
