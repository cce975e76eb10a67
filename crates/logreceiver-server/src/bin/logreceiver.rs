//! logreceiver
//!
//! Receives RFC 5424 syslog over UDP and stores it in per-host, time
//! partitioned PostgreSQL tables.
//!
//! ## Configuration
//!
//! `LOGRECEIVER_CONFIG` names an optional TOML file; single settings can be
//! overridden from the environment (`LOGRECEIVER_UDP_PORT`, `DATABASE_URL`,
//! ...). See `logreceiver_server::config` for the full list.
//!
//! ## Logging
//!
//! Controlled via `RUST_LOG`:
//! ```bash
//! RUST_LOG=debug logreceiver                        # Flushes and filter passes
//! RUST_LOG=info logreceiver                         # Standard logs (default)
//! RUST_LOG=logreceiver_storage=debug logreceiver    # One crate only
//! ```

use logreceiver_server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::load()?;
    tracing::info!(
        udp = %config.udp.socket_addr(),
        workers = config.udp.workers,
        hours_per_partition = config.storage.hours_per_partition,
        flush_interval_ms = config.storage.flush_interval_ms,
        "Starting logreceiver"
    );

    let server = Server::start(config).await?;
    server.run_until_signal().await?;

    Ok(())
}
