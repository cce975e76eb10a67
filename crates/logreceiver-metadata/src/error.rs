//! Host registry errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Host not found: {0}")]
    HostNotFound(i64),

    #[error("Host already exists for address {0}")]
    HostAlreadyExists(std::net::IpAddr),

    #[error("Invalid address stored for host {host_id}: {address}")]
    InvalidAddress { host_id: i64, address: String },

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

impl From<sqlx::migrate::MigrateError> for MetadataError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        MetadataError::MigrationError(e.to_string())
    }
}
