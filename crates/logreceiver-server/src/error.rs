//! Server errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Metadata error: {0}")]
    Metadata(#[from] logreceiver_metadata::MetadataError),

    #[error("Storage error: {0}")]
    Storage(#[from] logreceiver_storage::StorageError),
}
