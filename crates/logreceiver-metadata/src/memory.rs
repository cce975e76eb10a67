//! In-memory host store for tests and development.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use logreceiver_core::Host;
use tokio::sync::Mutex;

use crate::error::{MetadataError, Result};
use crate::HostStore;

#[derive(Default)]
struct Tables {
    next_id: i64,
    hosts: BTreeMap<i64, Host>,
}

/// Keeps hosts in a map; IDs come from a counter starting at 1.
#[derive(Default)]
pub struct InMemoryHostStore {
    tables: Mutex<Tables>,
}

impl InMemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already contains `hosts`.
    pub fn with_hosts(hosts: Vec<Host>) -> Self {
        let next_id = hosts.iter().map(|h| h.id).max().unwrap_or(0);
        let hosts = hosts.into_iter().map(|h| (h.id, h)).collect();
        Self {
            tables: Mutex::new(Tables { next_id, hosts }),
        }
    }
}

#[async_trait]
impl HostStore for InMemoryHostStore {
    async fn load_all(&self) -> Result<Vec<Host>> {
        let tables = self.tables.lock().await;
        Ok(tables.hosts.values().cloned().collect())
    }

    async fn insert_host(
        &self,
        address: IpAddr,
        name: Option<&str>,
        data_retention_hours: Option<u32>,
    ) -> Result<Host> {
        let mut tables = self.tables.lock().await;
        if tables.hosts.values().any(|h| h.address == address) {
            return Err(MetadataError::HostAlreadyExists(address));
        }
        tables.next_id += 1;
        let host = Host::new(tables.next_id, address, name.map(str::to_string))
            .with_retention_hours(data_retention_hours);
        tables.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    async fn update_host(&self, host: &Host) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.hosts.get_mut(&host.id) {
            Some(existing) => {
                existing.name = host.name.clone();
                existing.data_retention_hours = host.data_retention_hours;
                Ok(())
            }
            None => Err(MetadataError::HostNotFound(host.id)),
        }
    }

    async fn delete_host(&self, host_id: i64) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .hosts
            .remove(&host_id)
            .map(|_| ())
            .ok_or(MetadataError::HostNotFound(host_id))
    }
}
