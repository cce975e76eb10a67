//! PostgreSQL Host Store
//!
//! Persists hosts in the `log_hosts` table:
//!
//! ```sql
//! CREATE TABLE log_hosts (
//!     host_id bigint PRIMARY KEY DEFAULT nextval('seq_log_hosts'),
//!     ip inet UNIQUE NOT NULL,
//!     name text,
//!     data_retention_hours integer
//! );
//! ```
//!
//! The schema is created by the embedded migrations on startup. Addresses
//! travel as text (`$1::inet` on the way in, `host(ip)` on the way out) so no
//! extra sqlx type features are needed.

use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use logreceiver_core::Host;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::error::{MetadataError, Result};
use crate::HostStore;

pub struct PostgresHostStore {
    pool: PgPool,
}

impl PostgresHostStore {
    /// Connects to `url` and runs the migrations.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Uses an existing pool, e.g. one shared with the log storage backend.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn host_from_row(row: &PgRow) -> Result<Host> {
        let host_id: i64 = row.get("host_id");
        let ip: String = row.get("ip");
        let address = ip
            .parse::<IpAddr>()
            .map_err(|_| MetadataError::InvalidAddress {
                host_id,
                address: ip.clone(),
            })?;
        let retention: Option<i32> = row.get("data_retention_hours");

        Ok(Host::new(host_id, address, row.get("name"))
            .with_retention_hours(retention.and_then(|h| u32::try_from(h).ok())))
    }
}

fn retention_param(hours: Option<u32>) -> Option<i32> {
    hours.map(|h| i32::try_from(h).unwrap_or(i32::MAX))
}

#[async_trait]
impl HostStore for PostgresHostStore {
    async fn load_all(&self) -> Result<Vec<Host>> {
        let rows = sqlx::query(
            "SELECT host_id, host(ip) AS ip, name, data_retention_hours
             FROM log_hosts
             ORDER BY host_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::host_from_row).collect()
    }

    async fn insert_host(
        &self,
        address: IpAddr,
        name: Option<&str>,
        data_retention_hours: Option<u32>,
    ) -> Result<Host> {
        let row = sqlx::query(
            "INSERT INTO log_hosts (ip, name, data_retention_hours)
             VALUES ($1::inet, $2, $3)
             RETURNING host_id",
        )
        .bind(address.to_string())
        .bind(name)
        .bind(retention_param(data_retention_hours))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if e.to_string().contains("duplicate key") {
                MetadataError::HostAlreadyExists(address)
            } else {
                MetadataError::from(e)
            }
        })?;

        Ok(
            Host::new(row.get("host_id"), address, name.map(str::to_string))
                .with_retention_hours(data_retention_hours),
        )
    }

    async fn update_host(&self, host: &Host) -> Result<()> {
        let result = sqlx::query(
            "UPDATE log_hosts SET name = $2, data_retention_hours = $3 WHERE host_id = $1",
        )
        .bind(host.id)
        .bind(host.name.as_deref())
        .bind(retention_param(host.data_retention_hours))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::HostNotFound(host.id));
        }
        Ok(())
    }

    async fn delete_host(&self, host_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM log_hosts WHERE host_id = $1")
            .bind(host_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::HostNotFound(host_id));
        }
        Ok(())
    }
}
