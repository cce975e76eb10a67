//! Host Registry
//!
//! In-memory index of every known host, by address and by ID, backed by a
//! [`HostStore`]. The registry is the single allocation point for host IDs.
//!
//! ## Locking
//!
//! - `index` (`std::sync::RwLock`): lookups on the ingestion hot path take
//!   the read lock only
//! - `allocation` (`tokio::sync::Mutex`): serializes lookup + persist +
//!   insert for unseen addresses, so two datagrams racing from the same new
//!   address still produce exactly one host
//!
//! Events are broadcast after both locks are released.
//!
//! ## Host names
//!
//! The name declared in the first message from an address sticks. Later
//! messages may declare a different name (or different case) and still map
//! to the same host, which keeps the host's table name stable.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use logreceiver_core::{Host, HostResolver};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::error::{MetadataError, Result};
use crate::HostStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notification for registry listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Added(Host),
    Updated(Host),
    Deleted(Host),
}

impl HostEvent {
    pub fn host(&self) -> &Host {
        match self {
            HostEvent::Added(h) | HostEvent::Updated(h) | HostEvent::Deleted(h) => h,
        }
    }
}

#[derive(Default)]
struct HostIndex {
    by_address: HashMap<IpAddr, Host>,
    by_id: HashMap<i64, Host>,
}

impl HostIndex {
    fn insert(&mut self, host: Host) {
        self.by_address.insert(host.address, host.clone());
        self.by_id.insert(host.id, host);
    }

    fn remove(&mut self, host: &Host) {
        self.by_address.remove(&host.address);
        self.by_id.remove(&host.id);
    }
}

pub struct HostRegistry {
    store: Arc<dyn HostStore>,
    default_retention_hours: Option<u32>,
    index: RwLock<HostIndex>,
    allocation: Mutex<()>,
    events: broadcast::Sender<HostEvent>,
}

impl HostRegistry {
    /// Loads every host from `store`.
    ///
    /// `default_retention_hours` is applied to hosts created later on.
    pub async fn load(
        store: Arc<dyn HostStore>,
        default_retention_hours: Option<u32>,
    ) -> Result<Self> {
        let hosts = store.load_all().await?;
        info!(hosts = hosts.len(), "Loaded host registry");

        let mut index = HostIndex::default();
        for host in hosts {
            index.insert(host);
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            store,
            default_retention_hours,
            index: RwLock::new(index),
            allocation: Mutex::new(()),
            events,
        })
    }

    /// Receives every host event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn host_by_address(&self, address: &IpAddr) -> Option<Host> {
        self.read_index().by_address.get(address).cloned()
    }

    pub fn host_by_id(&self, host_id: i64) -> Option<Host> {
        self.read_index().by_id.get(&host_id).cloned()
    }

    /// All hosts, ordered by ID.
    pub fn all_hosts(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.read_index().by_id.values().cloned().collect();
        hosts.sort_by_key(|h| h.id);
        hosts
    }

    /// Returns the host for `address`, allocating one if it is new.
    pub async fn get_or_create_host(&self, address: IpAddr, name: Option<&str>) -> Result<Host> {
        if let Some(host) = self.host_by_address(&address) {
            return Ok(host);
        }

        let created = {
            let _guard = self.allocation.lock().await;

            // Another task may have allocated while we waited.
            if let Some(host) = self.host_by_address(&address) {
                return Ok(host);
            }

            let host = self
                .store
                .insert_host(address, name, self.default_retention_hours)
                .await?;
            self.write_index().insert(host.clone());
            host
        };

        info!(
            host_id = created.id,
            address = %created.address,
            name = ?created.name,
            "Registered new host"
        );
        self.emit(HostEvent::Added(created.clone()));
        Ok(created)
    }

    /// Persists changes to name or retention of an existing host.
    pub async fn update_host(&self, host: Host) -> Result<Host> {
        {
            let _guard = self.allocation.lock().await;
            let existing = self
                .host_by_id(host.id)
                .ok_or(MetadataError::HostNotFound(host.id))?;
            if existing.address != host.address {
                return Err(MetadataError::HostAlreadyExists(host.address));
            }
            self.store.update_host(&host).await?;
            self.write_index().insert(host.clone());
        }

        self.emit(HostEvent::Updated(host.clone()));
        Ok(host)
    }

    pub async fn delete_host(&self, host_id: i64) -> Result<Host> {
        let deleted = {
            let _guard = self.allocation.lock().await;
            let host = self
                .host_by_id(host_id)
                .ok_or(MetadataError::HostNotFound(host_id))?;
            self.store.delete_host(host_id).await?;
            self.write_index().remove(&host);
            host
        };

        info!(host_id, address = %deleted.address, "Deleted host");
        self.emit(HostEvent::Deleted(deleted.clone()));
        Ok(deleted)
    }

    fn emit(&self, event: HostEvent) {
        // No receivers is fine.
        if self.events.send(event).is_err() {
            debug!("Host event dropped, no listeners");
        }
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, HostIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, HostIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HostResolver for HostRegistry {
    async fn get_or_create_host(
        &self,
        address: IpAddr,
        name: Option<&str>,
    ) -> logreceiver_core::Result<Host> {
        HostRegistry::get_or_create_host(self, address, name)
            .await
            .map_err(|e| logreceiver_core::Error::HostResolution(e.to_string()))
    }
}
