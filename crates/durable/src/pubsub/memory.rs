//! In-process implementation of MessageBroker for testing

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::broker::*;

/// In-process broker delivering messages synchronously to handlers
///
/// Handlers are invoked on the publisher's task, outside of any internal
/// lock, so a handler may itself subscribe or unsubscribe.
///
/// # Example
///
/// ```
/// use authlink_durable::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// assert_eq!(broker.subscriber_count("register-1"), 0);
/// ```
pub struct InMemoryBroker {
    channels: DashMap<String, Vec<(SubscriptionId, MessageHandler)>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    published: AtomicU64,
}

impl InMemoryBroker {
    /// Create a connected in-memory broker
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Number of live subscriptions on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of live subscriptions across all channels
    pub fn total_subscriptions(&self) -> usize {
        self.channels.iter().map(|e| e.value().len()).sum()
    }

    /// Number of messages published since creation
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        self.channels.clear();
        debug!("in-memory broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<bool, BrokerError> {
        Ok(self.is_connected())
    }

    async fn publish(&self, channel: &str, message: Message) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.published.fetch_add(1, Ordering::SeqCst);

        // Snapshot the handlers so none run while the shard lock is held
        let handlers: Vec<(SubscriptionId, MessageHandler)> = self
            .channels
            .get(channel)
            .map(|subs| subs.value().clone())
            .unwrap_or_default();

        trace!(%channel, subscribers = handlers.len(), "publishing message");
        for (id, handler) in handlers {
            handler(channel, &message, id);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, BrokerError> {
        self.ensure_connected()?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        trace!(%channel, %id, "subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let removed = match self.channels.get_mut(channel) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|(sid, _)| *sid != id);
                before != subs.len()
            }
            None => false,
        };
        self.channels.remove_if(channel, |_, subs| subs.is_empty());

        if !removed {
            return Err(BrokerError::UnknownSubscription {
                channel: channel.to_string(),
                id,
            });
        }
        trace!(%channel, %id, "unsubscribed");
        Ok(())
    }
}
