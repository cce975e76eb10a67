//! logreceiver Filter Engine
//!
//! Pushes newly stored syslog messages to registered predicates without
//! rescanning history, and serves paged reads of stored messages.
//!
//! ## Key Components
//!
//! - [`FilterEngine`]: dirty-set driven incremental scans with per-host
//!   compare-and-swap watermarks
//! - [`PatternFormatter`]: renders messages for matching (`%Y-%m-%d %t` ...)
//! - [`MessageFilter`]: whole-match regex or substring predicate over a rendering
//! - [`Subscription`]: callback that forwards matches into a channel
//! - [`LogApi`]: subscribe/unsubscribe plus paged queries for a presentation layer
//!
//! ## Wiring
//!
//! The engine is the storage engine's [`FlushListener`](logreceiver_core::FlushListener):
//!
//! ```ignore
//! let engine = FilterEngine::start(registry.clone(), backend.clone(), FilterConfig::default());
//! let writers = PartitionWriterPool::new(backend.clone(), engine.clone(), storage_config)?;
//! let api = LogApi::new(registry, engine, MessageQuery::new(backend));
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod predicate;
pub mod subscription;
pub mod watermark;

pub use api::{ActiveSubscription, LogApi};
pub use config::FilterConfig;
pub use engine::FilterEngine;
pub use error::{FilterError, Result};
pub use format::{FormatterCache, PatternFormatter, DEFAULT_PATTERN};
pub use predicate::MessageFilter;
pub use subscription::{FilterCallback, MessageBatch, Subscription, SubscriptionId};
pub use watermark::WatermarkTable;
