//! Filter Error Types

use std::net::IpAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FilterError>;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Storage error: {0}")]
    Storage(#[from] logreceiver_storage::StorageError),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("Filter engine has been stopped")]
    EngineStopped,

    #[error("Unknown host: {0}")]
    UnknownHost(IpAddr),
}

impl FilterError {
    pub(crate) fn pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}
