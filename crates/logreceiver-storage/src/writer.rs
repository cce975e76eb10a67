//! Partition Writer
//!
//! Buffers encoded rows for one partition and bulk-inserts them.
//!
//! ## Flush Policy
//!
//! A supervised flush task wakes every `flush_interval`:
//!
//! - if at least `flush_interval` passed since the last flush, the buffer is
//!   flushed unconditionally (reason `timeout`)
//! - otherwise it is flushed only if it holds more than
//!   `max_chars_in_buffer` characters (reason `batch size exceeded`)
//!
//! `append` wakes the task early as soon as a row pushes the buffer over the
//! threshold, so a busy partition does not wait out the interval.
//!
//! ## Ordering
//!
//! The buffer lock is held for the whole COPY. Rows therefore reach the
//! database in append order, and the per-host sequence hands out entry IDs in
//! that order.
//!
//! ## Failure
//!
//! A failed COPY leaves the rows in the buffer. The flush task returns the
//! error, its supervisor restarts it after the restart delay and the same
//! rows are retried ahead of anything appended since.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use logreceiver_core::{FlushListener, Host, Interval, SupervisedTask, TaskContext};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::backend::LogBackend;
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::partition::PartitionSpec;

struct Buffer {
    rows: String,
    row_count: usize,
    chars: usize,
    last_flush: Instant,
}

struct WriterState {
    host: Host,
    partition: PartitionSpec,
    table: String,
    backend: Arc<dyn LogBackend>,
    listener: Arc<dyn FlushListener>,
    flush_interval: Duration,
    max_chars: usize,
    buffer: Mutex<Buffer>,
    closed: AtomicBool,
}

impl WriterState {
    async fn flush(&self, reason: &str) -> Result<u64> {
        let mut buffer = self.buffer.lock().await;
        buffer.last_flush = Instant::now();
        if buffer.row_count == 0 {
            return Ok(0);
        }

        let started = Instant::now();
        let inserted = self
            .backend
            .copy_rows(&self.host, &self.partition, &buffer.rows)
            .await?;

        debug!(
            partition = %self.table,
            reason,
            rows = buffer.row_count,
            chars = buffer.chars,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flushed partition buffer"
        );
        buffer.rows.clear();
        buffer.row_count = 0;
        buffer.chars = 0;
        drop(buffer);

        self.listener.partition_flushed(&self.host);
        Ok(inserted)
    }

    async fn over_threshold(&self) -> bool {
        self.buffer.lock().await.chars > self.max_chars
    }

    async fn run_flush_loop(&self, ctx: TaskContext) -> anyhow::Result<()> {
        while ctx.sleep(self.flush_interval).await {
            let elapsed = self.buffer.lock().await.last_flush.elapsed();
            let result = if elapsed >= self.flush_interval {
                self.flush("timeout").await
            } else if self.over_threshold().await {
                self.flush("batch size exceeded").await
            } else {
                continue;
            };

            if let Err(e) = result {
                error!(partition = %self.table, error = %e, "Failed to flush partition buffer");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Buffered writer for one partition of one host.
pub struct PartitionWriter {
    state: Arc<WriterState>,
    flusher: SupervisedTask,
}

impl PartitionWriter {
    /// Creates the partition in the backend and starts the flush task.
    pub async fn create(
        host: Host,
        partition: PartitionSpec,
        backend: Arc<dyn LogBackend>,
        listener: Arc<dyn FlushListener>,
        config: &StorageConfig,
    ) -> Result<Self> {
        if partition.host_id != host.id {
            return Err(StorageError::HostMismatch {
                expected: host.id,
                actual: partition.host_id,
            });
        }

        backend.ensure_partition(&host, &partition).await?;

        let table = partition.table_name();
        let state = Arc::new(WriterState {
            host,
            partition,
            table: table.clone(),
            backend,
            listener,
            flush_interval: config.flush_interval(),
            max_chars: config.max_chars_in_buffer,
            buffer: Mutex::new(Buffer {
                rows: String::new(),
                row_count: 0,
                chars: 0,
                last_flush: Instant::now(),
            }),
            closed: AtomicBool::new(false),
        });

        let task_state = Arc::clone(&state);
        let flusher = SupervisedTask::spawn(
            format!("flush-{}", table),
            config.task_restart_delay(),
            move |ctx| {
                let state = Arc::clone(&task_state);
                async move { state.run_flush_loop(ctx).await }
            },
        );

        info!(partition = %table, "Partition writer started");
        Ok(Self { state, flusher })
    }

    pub fn host(&self) -> &Host {
        &self.state.host
    }

    pub fn partition(&self) -> &PartitionSpec {
        &self.state.partition
    }

    pub fn interval(&self) -> &Interval {
        &self.state.partition.interval
    }

    pub fn table_name(&self) -> &str {
        &self.state.table
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Number of rows waiting for the next flush.
    pub async fn buffered_rows(&self) -> usize {
        self.state.buffer.lock().await.row_count
    }

    /// Appends one encoded row.
    ///
    /// Returns `true` if the buffer is now over the threshold, in which case
    /// the flush task has been woken.
    pub async fn append(&self, row: &str) -> Result<bool> {
        let mut buffer = self.state.buffer.lock().await;
        if self.is_closed() {
            return Err(StorageError::WriterClosed(self.state.table.clone()));
        }

        if buffer.row_count > 0 {
            buffer.rows.push('\n');
            buffer.chars += 1;
        }
        buffer.rows.push_str(row);
        buffer.chars += row.chars().count();
        buffer.row_count += 1;

        let over = buffer.chars > self.state.max_chars;
        drop(buffer);

        if over {
            self.flusher.wake();
        }
        Ok(over)
    }

    /// Flushes whatever is buffered right now.
    pub async fn flush(&self, reason: &str) -> Result<u64> {
        self.state.flush(reason).await
    }

    /// Rejects further appends, stops the flush task and flushes one last time.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let _buffer = self.state.buffer.lock().await;
            self.state.closed.store(true, Ordering::SeqCst);
        }
        self.flusher.stop().await;
        self.state.flush("shutdown").await?;
        info!(partition = %self.state.table, "Partition writer stopped");
        Ok(())
    }
}
