//! In-memory log backend.
//!
//! Behaves like the PostgreSQL backend as far as the engine can observe:
//! rows go through the same COPY text encoding, entry IDs come from one
//! sequence per host, and a row outside its partition's range is rejected
//! the way a partition constraint would reject it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use logreceiver_core::{Host, Interval, SyslogMessage};

use crate::backend::{Direction, LogBackend, PageRequest};
use crate::error::{Result, StorageError};
use crate::partition::{is_child_of, parent_table_name, PartitionSpec};
use crate::row::{decode_row, StoredRow};

struct MemoryPartition {
    interval: Interval,
    rows: Vec<StoredRow>,
}

#[derive(Default)]
struct HostTables {
    last_entry_id: i64,
    partitions: BTreeMap<String, MemoryPartition>,
}

#[derive(Default)]
pub struct InMemoryLogBackend {
    tables: Mutex<HashMap<String, HostTables>>,
    copies: AtomicUsize,
    failing_copies: AtomicUsize,
}

impl InMemoryLogBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `copy_rows` calls so far.
    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Makes the next `n` bulk inserts fail.
    pub fn fail_next_copies(&self, n: usize) {
        self.failing_copies.store(n, Ordering::SeqCst);
    }

    pub fn row_count(&self, host: &Host) -> usize {
        self.lock()
            .get(&parent_table_name(host))
            .map(|t| t.partitions.values().map(|p| p.rows.len()).sum())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HostTables>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LogBackend for InMemoryLogBackend {
    async fn ensure_partition(&self, host: &Host, partition: &PartitionSpec) -> Result<()> {
        let mut tables = self.lock();
        let host_tables = tables.entry(parent_table_name(host)).or_default();
        host_tables
            .partitions
            .entry(partition.table_name())
            .or_insert_with(|| MemoryPartition {
                interval: partition.interval,
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn copy_rows(&self, host: &Host, partition: &PartitionSpec, rows: &str) -> Result<u64> {
        let pending_failures = self.failing_copies.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_copies
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(StorageError::DatabaseError(sqlx::Error::Protocol(
                "injected copy failure".to_string(),
            )));
        }

        let table = partition.table_name();
        let mut tables = self.lock();
        let host_tables = tables
            .get_mut(&parent_table_name(host))
            .ok_or_else(|| StorageError::InvalidPartitionName(table.clone()))?;
        let interval = host_tables
            .partitions
            .get(&table)
            .map(|p| p.interval)
            .ok_or_else(|| StorageError::InvalidPartitionName(table.clone()))?;

        // Validate everything first so a bad row rejects the whole batch.
        let mut decoded = Vec::new();
        for line in rows.lines().filter(|l| !l.is_empty()) {
            let fields = decode_row(line)?;
            if !interval.contains(&fields.log_ts) {
                return Err(StorageError::OutsideInterval {
                    timestamp: fields.log_ts,
                    partition: table,
                });
            }
            decoded.push(fields);
        }

        let count = decoded.len() as u64;
        let mut next_id = host_tables.last_entry_id;
        let stored: Vec<StoredRow> = decoded
            .into_iter()
            .map(|fields| {
                next_id += 1;
                StoredRow {
                    entry_id: next_id,
                    fields,
                }
            })
            .collect();
        host_tables.last_entry_id = next_id;
        if let Some(target) = host_tables.partitions.get_mut(&table) {
            target.rows.extend(stored);
        }

        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(count)
    }

    async fn list_partitions(&self, host: &Host) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .get(&parent_table_name(host))
            .map(|t| t.partitions.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn drop_partition(&self, host: &Host, table: &str) -> Result<()> {
        if !is_child_of(table, &parent_table_name(host)) {
            return Err(StorageError::InvalidPartitionName(table.to_string()));
        }
        if let Some(host_tables) = self.lock().get_mut(&parent_table_name(host)) {
            host_tables.partitions.remove(table);
        }
        Ok(())
    }

    async fn latest_entry_id(&self, host: &Host) -> Result<Option<i64>> {
        Ok(self.lock().get(&parent_table_name(host)).and_then(|t| {
            t.partitions
                .values()
                .flat_map(|p| p.rows.iter().map(|r| r.entry_id))
                .max()
        }))
    }

    async fn fetch_page(&self, host: &Host, request: &PageRequest) -> Result<Vec<SyslogMessage>> {
        let mut rows: Vec<StoredRow> = {
            let tables = self.lock();
            let Some(host_tables) = tables.get(&parent_table_name(host)) else {
                return Ok(Vec::new());
            };
            host_tables
                .partitions
                .values()
                .flat_map(|p| p.rows.iter())
                .filter(|row| match request.direction {
                    Direction::Forward => {
                        request.entry_id.map_or(true, |id| row.entry_id > id)
                            && request.timestamp.map_or(true, |ts| row.fields.log_ts >= ts)
                    }
                    Direction::Backward => {
                        request.entry_id.map_or(true, |id| row.entry_id < id)
                            && request.timestamp.map_or(true, |ts| row.fields.log_ts < ts)
                    }
                })
                .cloned()
                .collect()
        };

        match request.direction {
            Direction::Forward => rows.sort_by_key(|r| r.entry_id),
            Direction::Backward => rows.sort_by_key(|r| std::cmp::Reverse(r.entry_id)),
        }

        rows.into_iter()
            .take(request.limit)
            .map(|row| row.into_message(host))
            .collect()
    }
}
