//! logreceiver Storage Engine
//!
//! Persists parsed syslog messages into time-partitioned PostgreSQL tables,
//! one range-partitioned parent table per host.
//!
//! ## Architecture
//!
//! ```text
//! SyslogMessage
//!      │ store()
//!      ▼
//! ┌─────────────────────┐   one per (host, bucket)   ┌──────────────────┐
//! │ PartitionWriterPool │ ─────────────────────────▶ │ PartitionWriter  │
//! └─────────────────────┘                            │ buffer + flusher │
//!                                                    └────────┬─────────┘
//!                                        COPY ... FROM STDIN  │  partition_flushed()
//!                                                    ┌────────▼─────────┐      │
//!                                                    │   LogBackend     │      ▼
//!                                                    │ Postgres / mem   │  FlushListener
//!                                                    └────────▲─────────┘  (filter engine)
//!                           RetentionPruner (drop) ───────────┤
//!                           MessageQuery (read pages) ────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`row`]: COPY text row encoding and decoding
//! - [`partition`]: bucket routing and partition naming
//! - [`PartitionWriter`]: per-partition buffer with size/time flush triggers
//! - [`PartitionWriterPool`]: routes messages, creates and evicts writers
//! - [`RetentionPruner`]: drops partitions past their host's retention
//! - [`MessageQuery`]: keyset-paginated reads with client-side filtering
//!
//! ## Usage Example
//!
//! ```ignore
//! use logreceiver_storage::{PartitionWriterPool, PostgresLogBackend, StorageConfig};
//!
//! let backend = Arc::new(PostgresLogBackend::new(&database_url, 10).await?);
//! let pool = PartitionWriterPool::new(backend, listener, StorageConfig::default())?;
//!
//! pool.store(&message).await?;
//! // ... rows reach the database within flush_interval ...
//! pool.shutdown().await?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod memory;
pub mod partition;
pub mod postgres;
pub mod query;
pub mod retention;
pub mod row;
pub mod writer;
pub mod writer_pool;

pub use backend::{Direction, LogBackend, PageRequest};
pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use memory::InMemoryLogBackend;
pub use partition::{parent_table_name, parse_table_name, PartitionSpec};
pub use postgres::PostgresLogBackend;
pub use query::{Anchor, MessageQuery};
pub use retention::RetentionPruner;
pub use row::{decode_row, encode_row};
pub use writer::PartitionWriter;
pub use writer_pool::PartitionWriterPool;
