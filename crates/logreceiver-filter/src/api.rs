//! Log API
//!
//! Read-side entry point for presentation layers: live subscriptions plus
//! paged access to stored messages.
//!
//! ```ignore
//! let filter = api.regex_filter(None, ".*ERROR.*")?;
//! let mut sub = api.subscribe(address, filter, 100).await?;
//!
//! render(&sub.initial);                  // newest 100 matches, newest first
//! while let Some(batch) = sub.updates.recv().await {
//!     render(&batch.messages);           // new matches, oldest first
//! }
//! ```

use std::net::IpAddr;
use std::sync::Arc;

use logreceiver_core::{Host, SyslogMessage};
use logreceiver_metadata::HostRegistry;
use logreceiver_storage::{Anchor, Direction, MessageQuery};
use tokio::sync::mpsc;

use crate::engine::FilterEngine;
use crate::error::{FilterError, Result};
use crate::format::{FormatterCache, PatternFormatter, DEFAULT_PATTERN};
use crate::predicate::MessageFilter;
use crate::subscription::{MessageBatch, Subscription, SubscriptionId};

/// Batches a subscriber may fall behind before its subscription is closed.
pub const SUBSCRIPTION_CAPACITY: usize = 64;

/// A live subscription returned by [`LogApi::subscribe`].
pub struct ActiveSubscription {
    pub id: SubscriptionId,
    /// The newest matching messages at subscription time, newest first
    pub initial: Vec<SyslogMessage>,
    pub updates: mpsc::Receiver<MessageBatch>,
}

pub struct LogApi {
    registry: Arc<HostRegistry>,
    engine: Arc<FilterEngine>,
    query: MessageQuery,
    formatters: FormatterCache,
}

impl LogApi {
    pub fn new(registry: Arc<HostRegistry>, engine: Arc<FilterEngine>, query: MessageQuery) -> Self {
        Self {
            registry,
            engine,
            query,
            formatters: FormatterCache::default(),
        }
    }

    fn formatter(&self, pattern: Option<&str>) -> Result<Arc<PatternFormatter>> {
        self.formatters.get(pattern.unwrap_or(DEFAULT_PATTERN))
    }

    /// Compiles a whole-match regex filter over `pattern` (default pattern if `None`).
    pub fn regex_filter(&self, pattern: Option<&str>, regex: &str) -> Result<MessageFilter> {
        MessageFilter::regex(self.formatter(pattern)?, regex)
    }

    /// Compiles a case-insensitive substring filter over `pattern`.
    pub fn substring_filter(&self, pattern: Option<&str>, needle: &str) -> Result<MessageFilter> {
        Ok(MessageFilter::substring(self.formatter(pattern)?, needle))
    }

    /// Registers `filter` for `address` and returns the newest `max` matches.
    ///
    /// The host does not need to be known yet; its first messages will be
    /// delivered through `updates`. A message stored while this call runs
    /// may show up in both `initial` and `updates`.
    pub async fn subscribe(
        &self,
        address: IpAddr,
        filter: MessageFilter,
        max: usize,
    ) -> Result<ActiveSubscription> {
        let (subscription, updates) = Subscription::channel(filter.clone(), SUBSCRIPTION_CAPACITY);
        let id = self.engine.register(address, Arc::new(subscription)).await?;

        let initial = match self.registry.host_by_address(&address) {
            Some(host) => {
                match self.query.latest(&host, max, |m| filter.matches(m)).await {
                    Ok(initial) => initial,
                    Err(e) => {
                        self.engine.unregister(id);
                        return Err(e.into());
                    }
                }
            }
            None => Vec::new(),
        };

        Ok(ActiveSubscription {
            id,
            initial,
            updates,
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.engine.unregister(id)
    }

    /// Up to `max` matching messages from `anchor` in `direction`.
    pub async fn get_messages(
        &self,
        address: IpAddr,
        filter: &MessageFilter,
        direction: Direction,
        anchor: Anchor,
        max: usize,
    ) -> Result<Vec<SyslogMessage>> {
        let host = self.require_host(address)?;
        Ok(self
            .query
            .page(&host, direction, anchor, max, |m| filter.matches(m))
            .await?)
    }

    /// The newest `max` matching messages, newest first.
    pub async fn latest_messages(
        &self,
        address: IpAddr,
        filter: &MessageFilter,
        max: usize,
    ) -> Result<Vec<SyslogMessage>> {
        let host = self.require_host(address)?;
        Ok(self.query.latest(&host, max, |m| filter.matches(m)).await?)
    }

    pub fn all_hosts(&self) -> Vec<Host> {
        self.registry.all_hosts()
    }

    pub fn host(&self, address: &IpAddr) -> Option<Host> {
        self.registry.host_by_address(address)
    }

    fn require_host(&self, address: IpAddr) -> Result<Host> {
        self.registry
            .host_by_address(&address)
            .ok_or(FilterError::UnknownHost(address))
    }
}
