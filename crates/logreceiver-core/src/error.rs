//! Error types for the core crate.
//!
//! Core errors are deliberately few: the only fallible operations here are
//! interval construction and the host resolution hook, whose implementations
//! live in other crates and report their failures as strings.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid interval: start {start} must be before end {end}")]
    InvalidInterval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Host resolution failed: {0}")]
    HostResolution(String),
}
