//! logreceiver Server
//!
//! Wires the pipeline together and owns its lifecycle.
//!
//! ## Startup Order
//!
//! 1. Connect the PostgreSQL pool and run the metadata migrations
//! 2. Load the host registry
//! 3. Start the filter engine, the partition writer pool and the retention pruner
//! 4. Bind the UDP socket
//!
//! ## Shutdown Order
//!
//! 1. Stop the UDP workers, so nothing new is stored
//! 2. Flush and close every partition writer
//! 3. Stop the retention pruner and the filter engine
//! 4. Close the database pool
//!
//! ## Usage
//!
//! ```ignore
//! let config = ServerConfig::load()?;
//! let server = Server::start(config).await?;
//! server.run_until_signal().await?;
//! ```

pub mod config;
pub mod error;
pub mod shutdown;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use logreceiver_core::SupervisedTask;
use logreceiver_filter::{FilterEngine, LogApi};
use logreceiver_metadata::{HostRegistry, HostStore, PostgresHostStore};
use logreceiver_storage::{
    LogBackend, MessageQuery, PartitionWriterPool, PostgresLogBackend, RetentionPruner,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};

pub use config::{DatabaseConfig, ServerConfig, UdpConfig};
pub use error::{Result, ServerError};
pub use shutdown::{shutdown_signal, ShutdownHandle};
pub use udp::UdpReceiver;

pub struct Server {
    registry: Arc<HostRegistry>,
    engine: Arc<FilterEngine>,
    writers: Arc<PartitionWriterPool>,
    pruner: SupervisedTask,
    udp: UdpReceiver,
    shutdown: ShutdownHandle,
    api: Arc<LogApi>,
    pool: Option<PgPool>,
}

impl Server {
    /// Starts the server against the configured PostgreSQL database.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        info!(
            host = %config.database.host,
            database = %config.database.name,
            pool_size = config.database.pool_size,
            "Connecting to PostgreSQL"
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.database.pool_size)
            .connect(&config.database.connection_url())
            .await?;

        let hosts = Arc::new(PostgresHostStore::from_pool(pool.clone()).await?);
        let backend = Arc::new(PostgresLogBackend::from_pool(pool.clone()));

        let mut server = Self::start_with(config, hosts, backend).await?;
        server.pool = Some(pool);
        Ok(server)
    }

    /// Starts the server on arbitrary host and log backends.
    ///
    /// `config` is used as given; a UDP port of `0` binds an ephemeral port.
    pub async fn start_with(
        config: ServerConfig,
        hosts: Arc<dyn HostStore>,
        backend: Arc<dyn LogBackend>,
    ) -> Result<Self> {
        let registry = Arc::new(
            HostRegistry::load(hosts, config.storage.default_data_retention_hours).await?,
        );

        let engine = FilterEngine::start(
            Arc::clone(&registry),
            Arc::clone(&backend),
            config.filter.clone(),
        );

        let writers = Arc::new(PartitionWriterPool::new(
            Arc::clone(&backend),
            engine.clone(),
            config.storage.clone(),
        )?);

        let pruner = Arc::new(RetentionPruner::new(
            Arc::clone(&registry),
            Arc::clone(&backend),
            config.storage.hours_per_partition,
        ))
        .start(
            config.storage.retention_check_interval(),
            config.storage.task_restart_delay(),
        );

        let api = Arc::new(LogApi::new(
            Arc::clone(&registry),
            Arc::clone(&engine),
            MessageQuery::new(backend),
        ));

        let shutdown = ShutdownHandle::new();
        let udp = match UdpReceiver::bind(
            &config.udp,
            registry.clone(),
            Arc::clone(&writers),
            shutdown.subscribe(),
        )
        .await
        {
            Ok(udp) => udp,
            Err(e) => {
                pruner.stop().await;
                engine.stop().await;
                if let Err(close_err) = writers.shutdown().await {
                    error!(error = %close_err, "Failed to close writers after startup error");
                }
                return Err(e);
            }
        };

        info!(address = %udp.local_addr(), "logreceiver started");

        Ok(Self {
            registry,
            engine,
            writers,
            pruner,
            udp,
            shutdown,
            api,
            pool: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub fn api(&self) -> Arc<LogApi> {
        Arc::clone(&self.api)
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn writers(&self) -> &Arc<PartitionWriterPool> {
        &self.writers
    }

    /// A handle that stops the UDP workers when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs until SIGINT or SIGTERM, then shuts down.
    pub async fn run_until_signal(self) -> Result<()> {
        let mut triggered = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = triggered.wait_for(|stop| *stop) => {
                info!("Shutdown requested");
            }
        }
        self.shutdown().await
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down");

        self.shutdown.trigger();
        self.udp.join().await;

        info!("Flushing all pending writes");
        let flushed = self.writers.shutdown().await;
        if let Err(e) = &flushed {
            error!(error = %e, "Error during writer pool shutdown");
        }

        self.pruner.stop().await;
        self.engine.stop().await;

        if let Some(pool) = self.pool {
            pool.close().await;
        }

        info!("logreceiver shut down");
        Ok(flushed?)
    }
}
