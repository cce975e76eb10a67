//! Writer Pool - Routes Messages to Partition Writers
//!
//! Keeps one [`PartitionWriter`] per (host, bucket) alive across messages.
//!
//! ## Layout
//!
//! ```text
//! host_id ──▶ bucket start (UTC) ──▶ OnceCell<PartitionWriter>
//!    1            2019-08-18 20:00        logs_web01_1_2019081820_5
//!    1            2019-08-19 00:00        logs_web01_1_2019081900_0
//!    2            2019-08-18 20:00        logs_db01_2_2019081820_5
//! ```
//!
//! ## Thread Safety
//!
//! - The map sits behind a `std::sync::RwLock` that is only held to look up
//!   or insert a slot, never across I/O
//! - Partition creation happens inside the slot's `OnceCell`, so concurrent
//!   first messages for a bucket create the partition once; a failed
//!   creation leaves the cell empty and the next message retries
//!
//! ## Eviction
//!
//! Whenever a new writer has been created, writers whose bucket no longer
//! contains the current time are stopped (with a final flush) and removed.
//! This runs at most once per `stale_partition_check_interval`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use logreceiver_core::{FlushListener, Host, SyslogMessage};
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::backend::LogBackend;
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::partition::PartitionSpec;
use crate::row::encode_row;
use crate::writer::PartitionWriter;

type Slot = Arc<OnceCell<Arc<PartitionWriter>>>;
type WriterMap = HashMap<i64, HashMap<DateTime<Utc>, Slot>>;

pub struct PartitionWriterPool {
    writers: RwLock<WriterMap>,
    backend: Arc<dyn LogBackend>,
    listener: Arc<dyn FlushListener>,
    config: StorageConfig,
    evicting: AtomicBool,
    last_eviction: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl PartitionWriterPool {
    pub fn new(
        backend: Arc<dyn LogBackend>,
        listener: Arc<dyn FlushListener>,
        config: StorageConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            writers: RwLock::new(HashMap::new()),
            backend,
            listener,
            config,
            evicting: AtomicBool::new(false),
            last_eviction: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn backend(&self) -> &Arc<dyn LogBackend> {
        &self.backend
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Buffers one parsed message in its partition.
    ///
    /// The row is durable only after the partition's next flush.
    pub async fn store(&self, message: &SyslogMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::WriterClosed("writer pool".to_string()));
        }

        let host = &message.host;
        let spec =
            PartitionSpec::for_timestamp(host, &message.timestamp, self.config.hours_per_partition)?;
        let row = encode_row(message)?;

        let slot = self.slot(host.id, spec.interval.start());
        let created = !slot.initialized();
        let writer = slot
            .get_or_try_init(|| self.create_writer(host, spec))
            .await?;

        if writer.host().id != host.id {
            return Err(StorageError::HostMismatch {
                expected: writer.host().id,
                actual: host.id,
            });
        }
        if !writer.interval().contains(&message.timestamp) {
            return Err(StorageError::OutsideInterval {
                timestamp: message.timestamp,
                partition: writer.table_name().to_string(),
            });
        }

        writer.append(&row).await?;

        if created {
            self.maybe_evict_stale(Utc::now()).await;
        }
        Ok(())
    }

    fn slot(&self, host_id: i64, bucket_start: DateTime<Utc>) -> Slot {
        {
            let writers = self.writers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = writers.get(&host_id).and_then(|b| b.get(&bucket_start)) {
                return Arc::clone(slot);
            }
        }

        let mut writers = self.writers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            writers
                .entry(host_id)
                .or_default()
                .entry(bucket_start)
                .or_default(),
        )
    }

    async fn create_writer(&self, host: &Host, spec: PartitionSpec) -> Result<Arc<PartitionWriter>> {
        tracing::debug!(
            host = %host.address,
            partition = %spec.table_name(),
            "Creating partition writer"
        );

        let writer = PartitionWriter::create(
            host.clone(),
            spec,
            Arc::clone(&self.backend),
            Arc::clone(&self.listener),
            &self.config,
        )
        .await
        .map_err(|e| {
            tracing::error!(host = %host.address, error = %e, "Failed to create partition");
            e
        })?;

        Ok(Arc::new(writer))
    }

    /// Evicts stale writers unless that happened less than
    /// `stale_partition_check_interval` ago or is already running.
    pub async fn maybe_evict_stale(&self, now: DateTime<Utc>) -> usize {
        {
            let last = self
                .last_eviction
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = *last {
                if last.elapsed() < self.config.stale_partition_check_interval() {
                    return 0;
                }
            }
        }
        if self.evicting.swap(true, Ordering::SeqCst) {
            return 0;
        }

        *self
            .last_eviction
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        let evicted = self.evict_stale_writers(now).await;
        self.evicting.store(false, Ordering::SeqCst);
        evicted
    }

    /// Stops and removes every writer whose bucket does not contain `now`.
    pub async fn evict_stale_writers(&self, now: DateTime<Utc>) -> usize {
        let mut stale = Vec::new();
        {
            let mut writers = self.writers.write().unwrap_or_else(PoisonError::into_inner);
            for buckets in writers.values_mut() {
                buckets.retain(|_, slot| match slot.get() {
                    Some(writer) if !writer.interval().contains(&now) => {
                        stale.push(Arc::clone(writer));
                        false
                    }
                    _ => true,
                });
            }
            writers.retain(|_, buckets| !buckets.is_empty());
        }

        let count = stale.len();
        for writer in stale {
            tracing::info!(partition = %writer.table_name(), "Evicting stale partition writer");
            if let Err(e) = writer.shutdown().await {
                tracing::error!(
                    partition = %writer.table_name(),
                    error = %e,
                    "Final flush of evicted partition failed"
                );
            }
        }
        count
    }

    fn all_writers(&self) -> Vec<Arc<PartitionWriter>> {
        let writers = self.writers.read().unwrap_or_else(PoisonError::into_inner);
        writers
            .values()
            .flat_map(|buckets| buckets.values())
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    /// Flushes every writer now; failures are logged, not returned.
    pub async fn flush_all(&self) -> Result<()> {
        let mut flush_count = 0;
        let mut error_count = 0;

        for writer in self.all_writers() {
            match writer.flush("manual").await {
                Ok(_) => flush_count += 1,
                Err(e) => {
                    error_count += 1;
                    tracing::error!(
                        partition = %writer.table_name(),
                        error = %e,
                        "Failed to flush partition writer"
                    );
                }
            }
        }

        if flush_count > 0 || error_count > 0 {
            tracing::debug!(flushed = flush_count, errors = error_count, "Flush completed");
        }
        Ok(())
    }

    /// Table names of all live writers, sorted.
    pub fn active_partitions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .all_writers()
            .iter()
            .map(|w| w.table_name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Stops every writer after a final flush. Later `store` calls fail.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down partition writers");
        self.closed.store(true, Ordering::SeqCst);

        let writers: Vec<Arc<PartitionWriter>> = {
            let mut map = self.writers.write().unwrap_or_else(PoisonError::into_inner);
            map.drain()
                .flat_map(|(_, buckets)| buckets.into_values())
                .filter_map(|slot| slot.get().cloned())
                .collect()
        };

        let writer_count = writers.len();
        let mut first_error = None;
        for writer in writers {
            if let Err(e) = writer.shutdown().await {
                tracing::error!(partition = %writer.table_name(), error = %e, "Final flush failed");
                first_error.get_or_insert(e);
            }
        }

        tracing::info!(writer_count, "Partition writers stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLogBackend;
    use chrono::{FixedOffset, TimeZone};
    use logreceiver_core::NoopFlushListener;

    fn host(id: i64) -> Host {
        Host::new(
            id,
            format!("10.0.0.{}", id).parse().unwrap(),
            Some(format!("h{}", id)),
        )
    }

    fn message(host: Host, hour: u32) -> SyslogMessage {
        let ts = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2019, 8, 18, hour, 30, 0)
            .unwrap();
        let mut msg = SyslogMessage::new(host, ts, 14);
        msg.message = Some(format!("at {}", hour));
        msg
    }

    fn pool(backend: Arc<InMemoryLogBackend>) -> PartitionWriterPool {
        PartitionWriterPool::new(backend, Arc::new(NoopFlushListener), StorageConfig::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes_by_host_and_bucket() {
        let backend = Arc::new(InMemoryLogBackend::new());
        let pool = pool(backend.clone());

        pool.store(&message(host(1), 1)).await.unwrap();
        pool.store(&message(host(1), 2)).await.unwrap();
        pool.store(&message(host(1), 5)).await.unwrap();
        pool.store(&message(host(2), 1)).await.unwrap();

        // The first writer is evicted right after creation, the rest wait for shutdown.
        pool.shutdown().await.unwrap();
        assert_eq!(backend.row_count(&host(1)), 3);
        assert_eq!(backend.row_count(&host(2)), 1);

        let partitions = backend.list_partitions(&host(1)).await.unwrap();
        assert_eq!(
            partitions,
            vec!["logs_h1_1_2019081800_0", "logs_h1_1_2019081804_1"]
        );
    }

    #[tokio::test]
    async fn test_evicts_writers_outside_current_bucket() {
        let backend = Arc::new(InMemoryLogBackend::new());
        let pool = PartitionWriterPool::new(
            backend.clone(),
            Arc::new(NoopFlushListener),
            StorageConfig {
                stale_partition_check_interval_ms: 60 * 60 * 1000,
                ..Default::default()
            },
        )
        .unwrap();

        let now = Utc::now();
        let mut current = SyslogMessage::new(host(1), now.fixed_offset(), 14);
        current.message = Some("now".to_string());

        pool.store(&message(host(1), 1)).await.unwrap();
        pool.store(&current).await.unwrap();
        assert_eq!(pool.active_partitions().len(), 1);

        // The last check is recent, so nothing else goes away.
        pool.store(&message(host(1), 9)).await.unwrap();
        assert_eq!(pool.active_partitions().len(), 2);

        assert_eq!(pool.evict_stale_writers(now).await, 1);
        assert_eq!(pool.active_partitions().len(), 1);
        assert_eq!(backend.row_count(&host(1)), 2);

        pool.shutdown().await.unwrap();
        assert_eq!(backend.row_count(&host(1)), 3);
    }

    #[tokio::test]
    async fn test_store_after_shutdown_fails() {
        let pool = pool(Arc::new(InMemoryLogBackend::new()));
        pool.shutdown().await.unwrap();
        assert!(matches!(
            pool.store(&message(host(1), 1)).await,
            Err(StorageError::WriterClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_partition_creation_is_retried() {
        struct FailingOnce {
            inner: InMemoryLogBackend,
            failed: AtomicBool,
        }

        #[async_trait::async_trait]
        impl LogBackend for FailingOnce {
            async fn ensure_partition(&self, host: &Host, partition: &PartitionSpec) -> Result<()> {
                if !self.failed.swap(true, Ordering::SeqCst) {
                    return Err(StorageError::InvalidConfig("no tablespace".to_string()));
                }
                self.inner.ensure_partition(host, partition).await
            }
            async fn copy_rows(&self, host: &Host, p: &PartitionSpec, rows: &str) -> Result<u64> {
                self.inner.copy_rows(host, p, rows).await
            }
            async fn list_partitions(&self, host: &Host) -> Result<Vec<String>> {
                self.inner.list_partitions(host).await
            }
            async fn drop_partition(&self, host: &Host, table: &str) -> Result<()> {
                self.inner.drop_partition(host, table).await
            }
            async fn latest_entry_id(&self, host: &Host) -> Result<Option<i64>> {
                self.inner.latest_entry_id(host).await
            }
            async fn fetch_page(
                &self,
                host: &Host,
                request: &crate::PageRequest,
            ) -> Result<Vec<SyslogMessage>> {
                self.inner.fetch_page(host, request).await
            }
        }

        let backend = Arc::new(FailingOnce {
            inner: InMemoryLogBackend::new(),
            failed: AtomicBool::new(false),
        });
        let pool = PartitionWriterPool::new(
            backend.clone(),
            Arc::new(NoopFlushListener),
            StorageConfig::default(),
        )
        .unwrap();

        let now = SyslogMessage::new(host(1), Utc::now().fixed_offset(), 14);
        assert!(pool.store(&now).await.is_err());
        pool.store(&now).await.unwrap();
        pool.shutdown().await.unwrap();
        assert_eq!(backend.inner.row_count(&host(1)), 1);
    }
}
