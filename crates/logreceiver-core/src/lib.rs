//! Core types shared by every logreceiver crate.
//!
//! - [`Host`]: identity of a log source, keyed by network address
//! - [`SyslogMessage`]: one parsed RFC 5424 entry
//! - [`Interval`]: half-open UTC time range used for partition routing
//! - [`SupervisedTask`]: self-restarting background worker
//!
//! Two small traits decouple the pipeline stages from each other:
//! [`HostResolver`] lets the parser allocate host identities without
//! depending on the registry crate, and [`FlushListener`] lets the storage
//! engine raise the dirty signal without depending on the filter engine.

pub mod error;
pub mod host;
pub mod interval;
pub mod message;
pub mod task;

pub use error::{Error, Result};
pub use host::{FlushListener, Host, HostResolver, NoopFlushListener};
pub use interval::Interval;
pub use message::{SdElement, SyslogMessage, MAX_PRIORITY};
pub use task::{SupervisedTask, TaskContext, DEFAULT_RESTART_DELAY};
