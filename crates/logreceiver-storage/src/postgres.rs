//! PostgreSQL Log Backend
//!
//! ## Schema
//!
//! One sequence and one range-partitioned parent table per host, created on
//! first use:
//!
//! ```sql
//! CREATE SEQUENCE IF NOT EXISTS seq_logs_myhost_7;
//! CREATE TABLE IF NOT EXISTS logs_myhost_7 (
//!     entry_id bigint NOT NULL DEFAULT nextval('seq_logs_myhost_7'),
//!     priority smallint NOT NULL,
//!     log_ts timestamptz NOT NULL,
//!     log_ts_fraction integer NOT NULL,
//!     host_id bigint NOT NULL,
//!     app_name text,
//!     proc_id text,
//!     msg_id text,
//!     params jsonb,
//!     msg text
//! ) PARTITION BY RANGE (log_ts);
//! CREATE TABLE IF NOT EXISTS logs_myhost_7_2019081820_5
//!     PARTITION OF logs_myhost_7 FOR VALUES FROM ('2019-08-18 20:00:00+00') TO ('2019-08-19 00:00:00+00');
//! ```
//!
//! ## Writes
//!
//! Rows are streamed with `COPY ... FROM STDIN` on a connection acquired for
//! the duration of one flush. A failed COPY is aborted so the connection
//! goes back to the pool clean.
//!
//! Table names are never bound as parameters; they are built from
//! [`Host::sql_name`], which only yields `[a-z0-9_]`, and the host ID, and
//! are kept within PostgreSQL's 63-byte identifier limit.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logreceiver_core::{Host, SyslogMessage};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::{Direction, LogBackend, PageRequest};
use crate::error::{Result, StorageError};
use crate::partition::{is_child_of, parent_table_name, sequence_name, PartitionSpec};
use crate::row::{utc_to_fixed, RowFields, StoredRow, COPY_COLUMNS};

const UNDEFINED_TABLE: &str = "42P01";
const PARTITION_BOUND_FORMAT: &str = "%Y-%m-%d %H:%M:%S+00";

pub struct PostgresLogBackend {
    pool: PgPool,
    // Concurrent CREATE ... IF NOT EXISTS on the same name can still race
    // inside the catalog, so DDL is serialized.
    ddl_lock: Mutex<()>,
}

impl PostgresLogBackend {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            ddl_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn stored_row(row: &PgRow) -> Result<StoredRow> {
        let log_ts: DateTime<Utc> = row.try_get("log_ts")?;
        Ok(StoredRow {
            entry_id: row.try_get("entry_id")?,
            fields: RowFields {
                priority: row.try_get("priority")?,
                log_ts: utc_to_fixed(log_ts),
                log_ts_fraction: row.try_get("log_ts_fraction")?,
                host_id: row.try_get("host_id")?,
                app_name: row.try_get("app_name")?,
                proc_id: row.try_get("proc_id")?,
                msg_id: row.try_get("msg_id")?,
                params: row.try_get("params")?,
                msg: row.try_get("msg")?,
            },
        })
    }
}

fn is_undefined_table(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNDEFINED_TABLE),
        _ => false,
    }
}

fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[async_trait]
impl LogBackend for PostgresLogBackend {
    async fn ensure_partition(&self, host: &Host, partition: &PartitionSpec) -> Result<()> {
        let parent = parent_table_name(host);
        let sequence = sequence_name(host);
        let child = partition.table_name();

        let _guard = self.ddl_lock.lock().await;

        sqlx::query(&format!("CREATE SEQUENCE IF NOT EXISTS {}", sequence))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {parent} (
                entry_id bigint NOT NULL DEFAULT nextval('{sequence}'),
                priority smallint NOT NULL,
                log_ts timestamptz NOT NULL,
                log_ts_fraction integer NOT NULL,
                host_id bigint NOT NULL,
                app_name text,
                proc_id text,
                msg_id text,
                params jsonb,
                msg text
            ) PARTITION BY RANGE (log_ts)",
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {parent}_log_ts_idx ON {parent} (log_ts)"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {parent}_entry_id_idx ON {parent} (entry_id)"
        ))
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {child} PARTITION OF {parent}
             FOR VALUES FROM ('{}') TO ('{}')",
            partition.interval.start().format(PARTITION_BOUND_FORMAT),
            partition.interval.end().format(PARTITION_BOUND_FORMAT),
        ))
        .execute(&self.pool)
        .await?;

        info!(
            host = %host.address,
            partition = %child,
            interval = %partition.interval,
            rows_affected = result.rows_affected(),
            "Partition ready"
        );
        Ok(())
    }

    async fn copy_rows(&self, host: &Host, partition: &PartitionSpec, rows: &str) -> Result<u64> {
        if partition.host_id != host.id {
            return Err(StorageError::HostMismatch {
                expected: host.id,
                actual: partition.host_id,
            });
        }

        let statement = format!(
            "COPY {} ({}) FROM STDIN (DELIMITER '|', NULL 'null')",
            partition.table_name(),
            COPY_COLUMNS
        );

        let mut conn = self.pool.acquire().await?;
        let mut copy = conn.copy_in_raw(&statement).await?;

        let mut payload = String::with_capacity(rows.len() + 1);
        payload.push_str(rows);
        payload.push('\n');

        let sent = copy.send(payload.as_bytes()).await.map(|_| ());
        if let Err(e) = sent {
            // The abort error adds nothing to the send error.
            let _ = copy.abort(e.to_string()).await;
            return Err(e.into());
        }
        let inserted = copy.finish().await?;

        debug!(partition = %partition.table_name(), rows = inserted, "COPY finished");
        Ok(inserted)
    }

    async fn list_partitions(&self, host: &Host) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT child.relname::text AS name
             FROM pg_inherits
             JOIN pg_class parent ON parent.oid = pg_inherits.inhparent
             JOIN pg_class child ON child.oid = pg_inherits.inhrelid
             WHERE parent.relname::text = $1
             ORDER BY child.relname",
        )
        .bind(parent_table_name(host))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StorageError::from))
            .collect()
    }

    async fn drop_partition(&self, host: &Host, table: &str) -> Result<()> {
        if !is_valid_identifier(table) || !is_child_of(table, &parent_table_name(host)) {
            return Err(StorageError::InvalidPartitionName(table.to_string()));
        }

        let _guard = self.ddl_lock.lock().await;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_entry_id(&self, host: &Host) -> Result<Option<i64>> {
        let query = format!("SELECT max(entry_id) AS id FROM {}", parent_table_name(host));
        match sqlx::query(&query).fetch_one(&self.pool).await {
            Ok(row) => Ok(row.try_get("id")?),
            Err(e) if is_undefined_table(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_page(&self, host: &Host, request: &PageRequest) -> Result<Vec<SyslogMessage>> {
        let (id_op, ts_op, order) = match request.direction {
            Direction::Forward => (">", ">=", "ASC"),
            Direction::Backward => ("<", "<", "DESC"),
        };
        let query = format!(
            "SELECT entry_id, priority, log_ts, log_ts_fraction, host_id,
                    app_name, proc_id, msg_id, params::text AS params, msg
             FROM {table}
             WHERE ($1::bigint IS NULL OR entry_id {id_op} $1)
               AND ($2::timestamptz IS NULL OR log_ts {ts_op} $2)
             ORDER BY entry_id {order}
             LIMIT $3",
            table = parent_table_name(host),
        );

        let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);
        let rows = match sqlx::query(&query)
            .bind(request.entry_id)
            .bind(request.timestamp)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_undefined_table(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        rows.iter()
            .map(|row| Self::stored_row(row)?.into_message(host))
            .collect()
    }
}
