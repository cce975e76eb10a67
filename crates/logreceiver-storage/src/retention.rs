//! Retention Pruner
//!
//! Drops whole partitions once they are older than their host's retention.
//! A partition is dropped only when its entire interval lies before
//! `now - retention`, so a partition is never partially expired.
//!
//! Hosts without a retention keep their data forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use logreceiver_core::SupervisedTask;
use logreceiver_metadata::HostRegistry;
use tracing::{info, warn};

use crate::backend::LogBackend;
use crate::error::Result;
use crate::partition::parse_table_name;

pub struct RetentionPruner {
    registry: Arc<HostRegistry>,
    backend: Arc<dyn LogBackend>,
    hours_per_partition: u32,
}

impl RetentionPruner {
    pub fn new(
        registry: Arc<HostRegistry>,
        backend: Arc<dyn LogBackend>,
        hours_per_partition: u32,
    ) -> Self {
        Self {
            registry,
            backend,
            hours_per_partition,
        }
    }

    /// Drops every expired partition of every host and returns how many.
    pub async fn prune_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut dropped = 0;

        for host in self.registry.all_hosts() {
            let Some(retention) = host.data_retention() else {
                continue;
            };
            let cutoff = now - retention;

            for table in self.backend.list_partitions(&host).await? {
                let parsed = match parse_table_name(&table, self.hours_per_partition) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(host = %host.address, partition = %table, error = %e, "Skipping unrecognized partition");
                        continue;
                    }
                };

                if parsed.interval.ends_before(&cutoff) {
                    self.backend.drop_partition(&host, &table).await?;
                    info!(
                        host = %host.address,
                        partition = %table,
                        interval = %parsed.interval,
                        "Dropped expired partition"
                    );
                    dropped += 1;
                }
            }
        }

        Ok(dropped)
    }

    /// Runs [`prune_once`](Self::prune_once) now and then every `interval`.
    pub fn start(self: Arc<Self>, interval: Duration, restart_delay: Duration) -> SupervisedTask {
        SupervisedTask::spawn("retention-pruner", restart_delay, move |ctx| {
            let pruner = Arc::clone(&self);
            async move {
                loop {
                    pruner.prune_once(Utc::now()).await?;
                    if !ctx.sleep(interval).await {
                        return Ok(());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLogBackend;
    use crate::partition::PartitionSpec;
    use chrono::TimeZone;
    use logreceiver_core::Host;
    use logreceiver_metadata::InMemoryHostStore;

    async fn setup(
        retention_hours: Option<u32>,
    ) -> (Arc<HostRegistry>, Arc<InMemoryLogBackend>, Host) {
        let store = Arc::new(InMemoryHostStore::new());
        let registry = Arc::new(HostRegistry::load(store, retention_hours).await.unwrap());
        let host = registry
            .get_or_create_host("10.9.9.9".parse().unwrap(), Some("old"))
            .await
            .unwrap();
        (registry, Arc::new(InMemoryLogBackend::new()), host)
    }

    async fn create_partitions(backend: &InMemoryLogBackend, host: &Host, hours: &[u32]) {
        for hour in hours {
            let ts = Utc.with_ymd_and_hms(2019, 8, 18, *hour, 0, 0).unwrap();
            let spec = PartitionSpec::for_timestamp(host, &ts, 4).unwrap();
            backend.ensure_partition(host, &spec).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_drops_only_fully_expired_partitions() {
        let (registry, backend, host) = setup(Some(10)).await;
        create_partitions(&backend, &host, &[0, 4, 8, 12, 16, 20]).await;

        // Cutoff 2019-08-18 12:30: buckets ending at 04, 08 and 12 are gone.
        let now = Utc.with_ymd_and_hms(2019, 8, 18, 22, 30, 0).unwrap();
        let pruner = RetentionPruner::new(registry, backend.clone(), 4);
        assert_eq!(pruner.prune_once(now).await.unwrap(), 3);

        assert_eq!(
            backend.list_partitions(&host).await.unwrap(),
            vec![
                "logs_old_1_2019081812_3",
                "logs_old_1_2019081816_4",
                "logs_old_1_2019081820_5"
            ]
        );
    }

    #[tokio::test]
    async fn test_unlimited_retention_keeps_everything() {
        let (registry, backend, host) = setup(None).await;
        create_partitions(&backend, &host, &[0, 4]).await;

        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let pruner = RetentionPruner::new(registry, backend.clone(), 4);
        assert_eq!(pruner.prune_once(now).await.unwrap(), 0);
        assert_eq!(backend.list_partitions(&host).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_started_pruner_runs_immediately() {
        let (registry, backend, host) = setup(Some(1)).await;
        create_partitions(&backend, &host, &[0]).await;

        let pruner = Arc::new(RetentionPruner::new(registry, backend.clone(), 4));
        let task = pruner.start(Duration::from_secs(3600), Duration::from_secs(1));
        for _ in 0..100 {
            if backend.list_partitions(&host).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.stop().await;
        assert!(backend.list_partitions(&host).await.unwrap().is_empty());
    }
}
