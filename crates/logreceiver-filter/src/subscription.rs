//! Filter callbacks and channel-backed subscriptions.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use logreceiver_core::{Host, SyslogMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::predicate::MessageFilter;

/// Identifies a registered callback.
pub type SubscriptionId = u64;

/// Receives new messages of one host as the filter engine discovers them.
///
/// Callbacks are invoked from the filter task; they must not call
/// [`FilterEngine::register`](crate::FilterEngine::register), which waits for
/// that same task. A call to `on_messages` that outlives the engine's
/// delivery timeout removes the callback.
#[async_trait]
pub trait FilterCallback: Send + Sync {
    fn matches(&self, message: &SyslogMessage) -> bool;

    /// Called once per scanned batch with the batch's matching messages, in
    /// ascending entry ID order. Never called with an empty batch.
    async fn on_messages(&self, host: &Host, messages: Vec<SyslogMessage>);

    /// A closed callback is dropped by the next filter pass.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Matching messages of one batch.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    pub host: Host,
    pub messages: Vec<SyslogMessage>,
}

/// Forwards matching messages into a bounded channel.
///
/// Delivery never waits for the consumer. A batch that does not fit closes
/// the subscription: the engine drops it on its next pass, and the receiver
/// sees the end of the channel once it has drained what was queued.
/// Dropping the receiver closes the subscription as well.
pub struct Subscription {
    filter: MessageFilter,
    sender: mpsc::Sender<MessageBatch>,
    overflowed: AtomicBool,
}

impl Subscription {
    pub fn channel(filter: MessageFilter, capacity: usize) -> (Self, mpsc::Receiver<MessageBatch>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let subscription = Self {
            filter,
            sender,
            overflowed: AtomicBool::new(false),
        };
        (subscription, receiver)
    }

    pub fn filter(&self) -> &MessageFilter {
        &self.filter
    }

    /// Whether a batch was refused because the consumer fell behind.
    pub fn has_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FilterCallback for Subscription {
    fn matches(&self, message: &SyslogMessage) -> bool {
        self.filter.matches(message)
    }

    async fn on_messages(&self, host: &Host, messages: Vec<SyslogMessage>) {
        let batch = MessageBatch {
            host: host.clone(),
            messages,
        };
        match self.sender.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => {
                self.overflowed.store(true, Ordering::SeqCst);
                warn!(
                    host = %host.address,
                    dropped = batch.messages.len(),
                    capacity = self.sender.max_capacity(),
                    "Subscriber fell behind, closing subscription"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(host = %host.address, "Subscriber went away");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.has_overflowed() || self.sender.is_closed()
    }
}
