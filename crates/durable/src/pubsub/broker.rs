//! MessageBroker trait definition

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Messages are arbitrary JSON values
pub type Message = serde_json::Value;

/// Callback invoked for every message delivered to a subscription
///
/// Receives the channel, the message and the handle of the subscription the
/// message was delivered to. Handlers run on the broker's delivery path and
/// must not block.
pub type MessageHandler = Arc<dyn Fn(&str, &Message, SubscriptionId) + Send + Sync>;

/// Handle returned by [`MessageBroker::subscribe`], required to unsubscribe
///
/// Brokers hand out ids starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Operation requires a connected broker
    #[error("broker is not connected")]
    NotConnected,

    /// Unsubscribe with a handle the broker does not know
    #[error("unknown subscription {id} on channel {channel}")]
    UnknownSubscription { channel: String, id: SubscriptionId },

    /// Underlying transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Message could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Fan-out publish/subscribe messaging with named channels
///
/// Every subscriber on a channel receives every message published to it
/// after it subscribed. Delivery order across channels is unspecified.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Open the underlying connection
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Close the underlying connection, dropping all subscriptions
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Whether the broker is currently connected
    fn is_connected(&self) -> bool;

    /// Round-trip health check
    async fn ping(&self) -> Result<bool, BrokerError>;

    /// Publish a message to every subscriber of `channel`
    async fn publish(&self, channel: &str, message: Message) -> Result<(), BrokerError>;

    /// Register `handler` for messages on `channel`
    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, BrokerError>;

    /// Remove a subscription created by [`subscribe`](Self::subscribe)
    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), BrokerError>;
}
