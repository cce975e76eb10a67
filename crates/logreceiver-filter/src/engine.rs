//! Filter Engine - Incremental Scans Driven by Dirty Signals
//!
//! Turns "rows were flushed for host X" into callback invocations without
//! rescanning a host's history.
//!
//! ## Architecture
//!
//! ```text
//! PartitionWriter ── partition_flushed(host) ──▶ dirty set ──wake──▶ filter task
//!                                                                     │
//!                         ┌───────────────────────────────────────────┘
//!                         ▼ per dirty host
//!        fetch_after(watermark, batch_size) ──▶ callbacks ──▶ CAS watermark
//! ```
//!
//! ## Watermarks
//!
//! Every scanned host has a watermark: the highest entry ID already
//! examined. A pass streams everything above it in ascending order, in
//! batches of `batch_size` rows, and advances the watermark after each
//! delivered batch by compare-and-swap. A CAS that fails means another scan
//! got there first; the pass stops for that host.
//!
//! The first pass over a host without a watermark only establishes it at
//! the newest stored entry ID and delivers nothing. A host that is not
//! registered yet (or has no rows) starts at `0`, so its first rows are
//! delivered.
//!
//! ## Registration
//!
//! [`FilterEngine::register`] marks the host dirty, waits for the pass that
//! picks it up and only then adds the callback. A new subscriber therefore
//! starts at a freshly advanced watermark instead of the host's backlog;
//! the backlog is available through the query API.
//!
//! ## Slow Callbacks
//!
//! The filter task is shared by every host, so no callback may hold it up.
//! Each `on_messages` call is bounded by `delivery_timeout`; a callback that
//! exceeds it is removed. [`Subscription`](crate::Subscription) never waits
//! at all and closes itself when its channel is full.
//!
//! ## Delivery Guarantees
//!
//! Watermarks live in memory. After a restart the first pass establishes
//! them again, so delivery is at-least-once across restarts, and rows that
//! arrive between a restart and the first flush are not pushed to
//! subscribers.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use logreceiver_core::{FlushListener, Host, SupervisedTask, SyslogMessage, TaskContext};
use logreceiver_metadata::{HostEvent, HostRegistry};
use logreceiver_storage::LogBackend;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::FilterConfig;
use crate::error::{FilterError, Result};
use crate::subscription::{FilterCallback, SubscriptionId};
use crate::watermark::WatermarkTable;

type CallbackList = Vec<(SubscriptionId, Arc<dyn FilterCallback>)>;

#[derive(Default)]
struct DirtyState {
    hosts: HashSet<IpAddr>,
    /// Generation of the most recently started pass
    generation: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PassState {
    /// Generation of the most recently completed pass
    completed: u64,
    stopped: bool,
}

struct EngineState {
    registry: Arc<HostRegistry>,
    backend: Arc<dyn LogBackend>,
    config: FilterConfig,
    watermarks: WatermarkTable,
    dirty: Mutex<DirtyState>,
    callbacks: RwLock<HashMap<IpAddr, CallbackList>>,
    passes: watch::Sender<PassState>,
}

impl EngineState {
    fn dirty(&self) -> MutexGuard<'_, DirtyState> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        while !ctx.is_cancelled() {
            let (hosts, generation) = {
                let mut dirty = self.dirty();
                dirty.generation += 1;
                (std::mem::take(&mut dirty.hosts), dirty.generation)
            };

            if !hosts.is_empty() {
                debug!(hosts = hosts.len(), generation, "Running filter pass");
            }
            for address in hosts {
                if ctx.is_cancelled() {
                    break;
                }
                if let Err(e) = self.filter_host(address, &ctx).await {
                    error!(host = %address, error = %e, "Filter pass failed");
                }
            }

            self.passes.send_modify(|pass| pass.completed = generation);

            let idle = self.dirty().hosts.is_empty();
            if idle && !ctx.sleep(self.config.idle_recheck_interval()).await {
                break;
            }
        }
        Ok(())
    }

    /// Live callbacks of `address`, `None` if nobody listens to the host.
    fn live_callbacks(&self, address: &IpAddr) -> Option<CallbackList> {
        let callbacks = {
            let map = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            map.get(address)?.clone()
        };

        if callbacks.iter().any(|(_, cb)| cb.is_closed()) {
            let mut map = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = map.get_mut(address) {
                list.retain(|(id, cb)| {
                    let closed = cb.is_closed();
                    if closed {
                        debug!(host = %address, subscription = id, "Dropping closed callback");
                    }
                    !closed
                });
            }
        }

        Some(
            callbacks
                .into_iter()
                .filter(|(_, cb)| !cb.is_closed())
                .collect(),
        )
    }

    async fn filter_host(&self, address: IpAddr, ctx: &TaskContext) -> Result<()> {
        let Some(mut callbacks) = self.live_callbacks(&address) else {
            return Ok(());
        };

        let Some(host) = self.registry.host_by_address(&address) else {
            // Nothing can be stored for an unknown host yet.
            self.watermarks.compare_and_set(address, None, 0);
            return Ok(());
        };

        let Some(mut watermark) = self.watermarks.get(&address) else {
            let latest = self.backend.latest_entry_id(&host).await?.unwrap_or(0);
            if self.watermarks.compare_and_set(address, None, latest) {
                debug!(host = %address, watermark = latest, "Watermark established");
            }
            return Ok(());
        };

        debug!(
            host = %address,
            watermark,
            callbacks = callbacks.len(),
            "Scanning for new messages"
        );

        let batch_size = self.config.batch_size.max(1);
        while !ctx.is_cancelled() {
            let batch = self.backend.fetch_after(&host, watermark, batch_size).await?;
            let Some(last_id) = batch.last().and_then(|m| m.id) else {
                break;
            };
            let exhausted = batch.len() < batch_size;

            let timed_out =
                deliver(&host, &batch, &callbacks, self.config.delivery_timeout()).await;
            if !timed_out.is_empty() {
                self.remove_callbacks(&address, &timed_out);
                callbacks.retain(|(id, _)| !timed_out.contains(id));
            }

            if !self.watermarks.compare_and_set(address, Some(watermark), last_id) {
                debug!(host = %address, "Watermark moved by a concurrent scan");
                break;
            }
            watermark = last_id;

            if exhausted {
                break;
            }
        }
        Ok(())
    }

    fn remove_callbacks(&self, address: &IpAddr, ids: &[SubscriptionId]) {
        let mut map = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = map.get_mut(address) {
            list.retain(|(id, _)| !ids.contains(id));
        }
    }

    fn forget_host(&self, address: &IpAddr) {
        self.watermarks.remove(address);
        self.dirty().hosts.remove(address);
        let removed = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
            .map_or(0, |list| list.len());
        info!(host = %address, callbacks = removed, "Forgot host");
    }
}

/// Hands `batch` to every callback and returns the IDs of those that
/// did not finish within `timeout`.
async fn deliver(
    host: &Host,
    batch: &[SyslogMessage],
    callbacks: &CallbackList,
    timeout: Duration,
) -> Vec<SubscriptionId> {
    let mut timed_out = Vec::new();
    for (id, callback) in callbacks {
        if callback.is_closed() {
            continue;
        }
        let matching: Vec<SyslogMessage> = batch
            .iter()
            .filter(|m| callback.matches(m))
            .cloned()
            .collect();
        if matching.is_empty() {
            continue;
        }
        let count = matching.len();
        if tokio::time::timeout(timeout, callback.on_messages(host, matching))
            .await
            .is_err()
        {
            warn!(
                host = %host.address,
                subscription = id,
                messages = count,
                "Callback exceeded the delivery timeout, removing it"
            );
            timed_out.push(*id);
        }
    }
    timed_out
}

pub struct FilterEngine {
    state: Arc<EngineState>,
    task: SupervisedTask,
    events: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl FilterEngine {
    /// Starts the filter task and the host-deletion listener.
    pub fn start(
        registry: Arc<HostRegistry>,
        backend: Arc<dyn LogBackend>,
        config: FilterConfig,
    ) -> Arc<Self> {
        let (passes, _) = watch::channel(PassState::default());
        let restart_delay = config.task_restart_delay();
        let state = Arc::new(EngineState {
            registry,
            backend,
            config,
            watermarks: WatermarkTable::new(),
            dirty: Mutex::new(DirtyState::default()),
            callbacks: RwLock::new(HashMap::new()),
            passes,
        });

        let task_state = Arc::clone(&state);
        let task = SupervisedTask::spawn("filter-processor", restart_delay, move |ctx| {
            let state = Arc::clone(&task_state);
            async move { state.run(ctx).await }
        });

        let engine = Arc::new(Self {
            state,
            task,
            events: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });
        engine.watch_host_events();
        engine
    }

    /// Forgets hosts as soon as the registry reports them deleted.
    fn watch_host_events(&self) {
        let mut events = self.state.registry.subscribe();
        let state = Arc::downgrade(&self.state);

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(HostEvent::Deleted(host)) => match state.upgrade() {
                        Some(state) => state.forget_host(&host.address),
                        None => break,
                    },
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Host event listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.passes.borrow().stopped
    }

    /// Requests a scan of `address`.
    pub fn mark_dirty(&self, address: IpAddr) {
        self.state.dirty().hosts.insert(address);
        self.task.wake();
    }

    /// Registers `callback` for messages of `address`.
    ///
    /// Waits until a filter pass has brought the host's watermark up to date,
    /// so the callback only sees messages stored from now on.
    pub async fn register(
        &self,
        address: IpAddr,
        callback: Arc<dyn FilterCallback>,
    ) -> Result<SubscriptionId> {
        if self.is_stopped() {
            return Err(FilterError::EngineStopped);
        }

        self.state
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address)
            .or_default();

        let target = {
            let mut dirty = self.state.dirty();
            dirty.hosts.insert(address);
            dirty.generation
        };
        self.task.wake();

        let mut passes = self.state.passes.subscribe();
        let stopped = passes
            .wait_for(|pass| pass.stopped || pass.completed > target)
            .await
            .map_err(|_| FilterError::EngineStopped)?
            .stopped;
        if stopped {
            return Err(FilterError::EngineStopped);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.state
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address)
            .or_default()
            .push((id, callback));

        info!(host = %address, subscription = id, "Registered filter callback");
        Ok(id)
    }

    /// Removes a callback. Returns `false` if the ID is unknown.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut map = self
            .state
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut found = false;
        for list in map.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            found |= list.len() != before;
        }
        map.retain(|_, list| !list.is_empty());

        if found {
            info!(subscription = id, "Unregistered filter callback");
        }
        found
    }

    /// Drops the watermark and every callback of `address`.
    pub fn forget_host(&self, address: &IpAddr) {
        self.state.forget_host(address);
    }

    pub fn watermark(&self, address: &IpAddr) -> Option<i64> {
        self.state.watermarks.get(address)
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Stops the filter task. Pending and later registrations fail.
    pub async fn stop(&self) {
        self.state.passes.send_modify(|pass| pass.stopped = true);
        self.task.stop().await;
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(events) = events {
            events.abort();
        }
        info!("Filter engine stopped");
    }
}

impl FlushListener for FilterEngine {
    fn partition_flushed(&self, host: &Host) {
        self.mark_dirty(host.address);
    }
}
