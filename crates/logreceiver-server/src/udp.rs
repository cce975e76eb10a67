//! UDP Ingestion
//!
//! One socket, `workers` receive tasks. Each worker owns its receive buffer
//! and its [`SyslogParser`], so the only shared state on the hot path is the
//! socket and the writer pool.
//!
//! ```text
//! UdpSocket ──recv_from──▶ worker N: parse ──▶ PartitionWriterPool::store
//! ```
//!
//! A bad datagram never stops a worker: parse failures are logged at `warn`
//! and store failures at `error`, then the worker moves on.

use std::net::SocketAddr;
use std::sync::Arc;

use logreceiver_core::HostResolver;
use logreceiver_storage::PartitionWriterPool;
use logreceiver_syslog::SyslogParser;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::UdpConfig;
use crate::error::Result;

pub struct UdpReceiver {
    local_addr: SocketAddr,
    workers: Vec<JoinHandle<()>>,
}

impl UdpReceiver {
    /// Binds the socket and starts the workers. They run until `shutdown`
    /// turns `true` or its sender is dropped.
    pub async fn bind(
        config: &UdpConfig,
        resolver: Arc<dyn HostResolver>,
        writers: Arc<PartitionWriterPool>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.socket_addr()).await?);
        let local_addr = socket.local_addr()?;
        let worker_count = config.workers.max(1);

        let workers = (0..worker_count)
            .map(|index| {
                let worker = Worker {
                    index,
                    socket: Arc::clone(&socket),
                    parser: SyslogParser::new(Arc::clone(&resolver)),
                    writers: Arc::clone(&writers),
                    buffer: vec![0u8; config.max_receive_buffer_size],
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        info!(
            address = %local_addr,
            workers = worker_count,
            buffer_size = config.max_receive_buffer_size,
            "Listening for syslog datagrams"
        );

        Ok(Self {
            local_addr,
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for every worker to exit. Trigger the shutdown signal first.
    pub async fn join(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!(error = %e, "UDP worker ended abnormally");
            }
        }
        info!(address = %self.local_addr, "UDP receiver stopped");
    }
}

struct Worker {
    index: usize,
    socket: Arc<UdpSocket>,
    parser: SyslogParser,
    writers: Arc<PartitionWriterPool>,
    buffer: Vec<u8>,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = self.index, "UDP worker started");

        while !*shutdown.borrow() {
            let received = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                received = self.socket.recv_from(&mut self.buffer) => received,
            };

            match received {
                Ok((len, sender)) => self.handle_datagram(len, sender).await,
                Err(e) => warn!(worker = self.index, error = %e, "Failed to receive datagram"),
            }
        }

        debug!(worker = self.index, "UDP worker stopped");
    }

    async fn handle_datagram(&mut self, len: usize, sender: SocketAddr) {
        if len == self.buffer.len() {
            warn!(
                sender = %sender,
                bytes = len,
                "Datagram filled the receive buffer and may be truncated"
            );
        }

        let message = match self.parser.parse(sender.ip(), &self.buffer[..len]).await {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    sender = %sender,
                    offset = ?e.offset(),
                    error = %e,
                    "Dropping unparseable datagram"
                );
                return;
            }
        };

        if let Err(e) = self.writers.store(&message).await {
            error!(
                sender = %sender,
                host_id = message.host.id,
                error = %e,
                "Failed to store message"
            );
        }
    }
}
