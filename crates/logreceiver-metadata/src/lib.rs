//! logreceiver Host Registry
//!
//! Maps sender addresses to stable host identities and keeps the per-host
//! retention policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  get_or_create_host   ┌────────────────┐
//! │ SyslogParser │ ────────────────────▶ │  HostRegistry  │ ── HostEvent ──▶ listeners
//! └──────────────┘                       │ (in-memory map)│
//!                                        └───────┬────────┘
//!                                                │ load_all / insert_host
//!                                        ┌───────▼────────┐
//!                                        │   HostStore    │
//!                                        │ Postgres / mem │
//!                                        └────────────────┘
//! ```
//!
//! The registry loads the whole `log_hosts` table at startup and afterwards
//! only goes to the database to persist newly seen hosts.
//!
//! ## Usage Example
//!
//! ```ignore
//! use logreceiver_metadata::{HostRegistry, PostgresHostStore};
//!
//! let store = PostgresHostStore::new(&database_url, 10).await?;
//! let registry = HostRegistry::load(Arc::new(store), Some(7 * 24)).await?;
//!
//! let host = registry.get_or_create_host("10.0.0.1".parse()?, Some("web01")).await?;
//! println!("host {} is {}", host.id, host.display_name());
//! ```

use std::net::IpAddr;

use async_trait::async_trait;
use logreceiver_core::Host;

pub mod error;
pub mod memory;
pub mod postgres;
pub mod registry;

pub use error::{MetadataError, Result};
pub use memory::InMemoryHostStore;
pub use postgres::PostgresHostStore;
pub use registry::{HostEvent, HostRegistry};

/// Persistent table of hosts.
///
/// Implementations only persist; caching and event fan-out are the
/// registry's job.
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Returns every known host.
    async fn load_all(&self) -> Result<Vec<Host>>;

    /// Persists a new host and returns it with its allocated ID.
    ///
    /// Fails with [`MetadataError::HostAlreadyExists`] if the address is
    /// already registered.
    async fn insert_host(
        &self,
        address: IpAddr,
        name: Option<&str>,
        data_retention_hours: Option<u32>,
    ) -> Result<Host>;

    /// Stores the mutable fields (name, retention) of an existing host.
    async fn update_host(&self, host: &Host) -> Result<()>;

    async fn delete_host(&self, host_id: i64) -> Result<()>;
}
