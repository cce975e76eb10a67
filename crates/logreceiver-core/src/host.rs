//! Host identity
//!
//! A [`Host`] is the logical identity of a log source. It is allocated the
//! first time a datagram arrives from a previously unseen address and never
//! changes afterwards: the numeric ID is stable, never reused, and is what
//! every persisted row carries in its `host_id` column.
//!
//! ## SQL naming
//!
//! Every host owns one parent table (`logs_<sql_name>_<id>`). The SQL name
//! is not unique on its own; it is derived from the declared hostname when
//! there is one, otherwise from the address:
//!
//! | Host | SQL name |
//! |------|----------|
//! | `MyHost.example.org` | `myhost_example_org` |
//! | `192.168.1.10` | `192_168_1_10` |
//! | `fe80::1` | `fe80__1` |

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identity of a log source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    /// Registry-assigned identifier
    pub id: i64,

    /// Sender address, unique across all hosts
    pub address: IpAddr,

    /// Hostname from the first message that declared one
    pub name: Option<String>,

    /// How long rows are retained, `None` keeps them forever
    pub data_retention_hours: Option<u32>,
}

impl Host {
    pub fn new(id: i64, address: IpAddr, name: Option<String>) -> Self {
        Self {
            id,
            address,
            name,
            data_retention_hours: None,
        }
    }

    pub fn with_retention_hours(mut self, hours: Option<u32>) -> Self {
        self.data_retention_hours = hours;
        self
    }

    /// Lower-cased identifier safe to splice into table names.
    pub fn sql_name(&self) -> String {
        let raw = match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name.to_lowercase(),
            _ => self.address.to_string(),
        };
        raw.chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_alphanumeric() || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Declared name, falling back to the address.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.address.to_string(),
        }
    }

    pub fn data_retention(&self) -> Option<chrono::Duration> {
        self.data_retention_hours
            .map(|hours| chrono::Duration::hours(i64::from(hours)))
    }
}

/// Resolves (and allocates on first sight) the host behind a sender address.
///
/// The parser calls this as soon as it has read the HOSTNAME field, which is
/// the only point where message data crosses into identity assignment.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn get_or_create_host(&self, address: IpAddr, name: Option<&str>) -> Result<Host>;
}

/// Notified by the storage engine after rows for a host reached the database.
pub trait FlushListener: Send + Sync {
    fn partition_flushed(&self, host: &Host);
}

/// Listener that ignores flush notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlushListener;

impl FlushListener for NoopFlushListener {
    fn partition_flushed(&self, _host: &Host) {}
}
