//! Single-owner subscription handle with idempotent release

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::pubsub::{BrokerError, MessageBroker, MessageHandler, SubscriptionId};

/// A live broker subscription
///
/// The handle is either subscribed or released. [`release`](Self::release)
/// unsubscribes on the first call and is a no-op afterwards, so every exit
/// path of a wait can call it unconditionally. A handle dropped while still
/// subscribed schedules the unsubscribe on the current tokio runtime.
pub struct Subscription {
    broker: Arc<dyn MessageBroker>,
    channel: String,
    id: SubscriptionId,
    released: AtomicBool,
}

impl Subscription {
    /// Subscribe `handler` to `channel`
    pub async fn open(
        broker: Arc<dyn MessageBroker>,
        channel: impl Into<String>,
        handler: MessageHandler,
    ) -> Result<Self, BrokerError> {
        let channel = channel.into();
        let id = broker.subscribe(&channel, handler).await?;
        trace!(%channel, %id, "subscription opened");

        Ok(Self {
            broker,
            channel,
            id,
            released: AtomicBool::new(false),
        })
    }

    /// Broker handle for this subscription
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Channel this subscription listens on
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the subscription has not been released yet
    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }

    /// Unsubscribe from the broker
    ///
    /// Only the first call reaches the broker. The handle counts as released
    /// even if that unsubscribe fails; the error is returned to the caller.
    pub async fn release(&self) -> Result<(), BrokerError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.broker.unsubscribe(&self.channel, self.id).await?;
        trace!(channel = %self.channel, id = %self.id, "subscription released");
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let broker = self.broker.clone();
        let channel = std::mem::take(&mut self.channel);
        let id = self.id;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = broker.unsubscribe(&channel, id).await {
                        warn!(%channel, %id, error = %e, "failed to release dropped subscription");
                    }
                });
            }
            Err(_) => {
                warn!(%channel, %id, "subscription dropped outside a runtime; not released");
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{InMemoryBroker, Message};

    fn noop_handler() -> MessageHandler {
        Arc::new(|_: &str, _: &Message, _: SubscriptionId| {})
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let subscription = Subscription::open(broker.clone(), "register-1", noop_handler())
            .await
            .unwrap();
        assert!(subscription.is_active());
        assert_eq!(broker.subscriber_count("register-1"), 1);

        subscription.release().await.unwrap();
        subscription.release().await.unwrap();

        assert!(!subscription.is_active());
        assert_eq!(broker.subscriber_count("register-1"), 0);
    }

    #[tokio::test]
    async fn test_release_failure_still_marks_released() {
        let broker = Arc::new(InMemoryBroker::new());
        let subscription = Subscription::open(broker.clone(), "c", noop_handler())
            .await
            .unwrap();
        broker.disconnect().await.unwrap();

        assert!(matches!(
            subscription.release().await,
            Err(BrokerError::NotConnected)
        ));
        assert!(!subscription.is_active());
        assert!(subscription.release().await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let broker = Arc::new(InMemoryBroker::new());
        let subscription = Subscription::open(broker.clone(), "c", noop_handler())
            .await
            .unwrap();

        drop(subscription);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(broker.subscriber_count("c"), 0);
    }
}
