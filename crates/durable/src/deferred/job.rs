//! Deferred job: subscribe, initiate, then await one correlated message
//!
//! A deferred job lets a workflow step start an out-of-band operation (an
//! outbound HTTP request, a notification to a partner) and suspend until a
//! callback for it is published on a correlation channel.
//!
//! ```text
//! wait(timeout)
//!   ├─ subscribe(channel)            handle
//!   ├─ initiator(channel, handle)    side effect that will cause a publish
//!   ├─ first message ──► release ──► listener(message)
//!   └─ deadline      ──► release ──► Timeout
//! ```
//!
//! The subscription is opened before the initiator runs, so a callback that
//! arrives while the initiator is still in flight is not lost.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::subscription::Subscription;
use crate::config::EngineConfig;
use crate::pubsub::{BrokerError, Message, MessageBroker, MessageHandler, SubscriptionId};

/// Side effect started once the subscription is in place
pub type Initiator =
    Box<dyn FnOnce(String, SubscriptionId) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Consumer of the first message delivered on the channel
pub type Listener = Box<dyn FnOnce(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Build a correlation channel name from a workflow phase and an identifier
///
/// ```
/// use authlink_durable::deferred::channel_name;
///
/// assert_eq!(channel_name("register", "42"), "register-42");
/// ```
pub fn channel_name(phase: &str, id: impl fmt::Display) -> String {
    format!("{}-{}", phase, id)
}

/// Error type for deferred job waits
#[derive(Debug, thiserror::Error)]
pub enum DeferredJobError {
    #[error("deferred job has no initiator")]
    MissingInitiator,

    #[error("deferred job has no listener")]
    MissingListener,

    #[error("wait timeout must be positive")]
    InvalidTimeout,

    /// No message arrived on the channel before the deadline
    #[error("no message on channel {channel} within {timeout:?}")]
    Timeout { channel: String, timeout: Duration },

    #[error("initiator failed: {0}")]
    Initiator(#[source] anyhow::Error),

    #[error("listener failed: {0}")]
    Listener(#[source] anyhow::Error),

    /// The broker dropped the subscription without delivering a message
    #[error("channel {0} closed before a message arrived")]
    ChannelClosed(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl DeferredJobError {
    /// Whether the wait ended because the deadline passed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the job was misconfigured; these are raised before any I/O
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingInitiator | Self::MissingListener | Self::InvalidTimeout
        )
    }
}

/// A one-shot wait for a message on a correlation channel
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use authlink_durable::{DeferredJob, InMemoryBroker, MessageBroker};
///
/// # tokio_test::block_on(async {
/// let broker = Arc::new(InMemoryBroker::new());
/// let publisher = broker.clone();
///
/// DeferredJob::new(broker.clone(), "verify-42")
///     .init(move |channel, _id| async move {
///         // Stand-in for a partner calling back
///         publisher.publish(&channel, serde_json::json!({"status": "VERIFIED"})).await?;
///         Ok(())
///     })
///     .job(|message| async move {
///         assert_eq!(message["status"], "VERIFIED");
///         Ok(())
///     })
///     .wait(Duration::from_secs(1))
///     .await
///     .unwrap();
///
/// assert_eq!(broker.subscriber_count("verify-42"), 0);
/// # });
/// ```
pub struct DeferredJob {
    broker: Arc<dyn MessageBroker>,
    channel: String,
    initiator: Option<Initiator>,
    listener: Option<Listener>,
}

impl DeferredJob {
    /// Create a job waiting on `channel`
    pub fn new(broker: Arc<dyn MessageBroker>, channel: impl Into<String>) -> Self {
        Self {
            broker,
            channel: channel.into(),
            initiator: None,
            listener: None,
        }
    }

    /// Channel this job waits on
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Set the initiator, called with the channel and subscription handle
    pub fn init<F, Fut>(mut self, initiator: F) -> Self
    where
        F: FnOnce(String, SubscriptionId) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.initiator = Some(Box::new(
            move |channel: String, id: SubscriptionId| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(initiator(channel, id))
            },
        ));
        self
    }

    /// Set the listener, called with the first message on the channel
    pub fn job<F, Fut>(mut self, listener: F) -> Self
    where
        F: FnOnce(Message) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.listener = Some(Box::new(
            move |message: Message| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(listener(message))
            },
        ));
        self
    }

    /// Wait using the configured default timeout
    pub async fn wait_default(self, config: &EngineConfig) -> Result<(), DeferredJobError> {
        self.wait(config.default_wait_timeout).await
    }

    /// Subscribe, run the initiator and wait for the first message
    ///
    /// The deadline is fixed on entry and covers both the initiator and the
    /// wait for the message. A message may arrive before the initiator has
    /// finished; it resolves the wait and the initiator keeps running in the
    /// background. An initiator error fails the wait only while no message
    /// has arrived. The subscription is released exactly once,
    /// before the listener runs on success and before the error is returned
    /// otherwise.
    #[instrument(skip_all, fields(channel = %self.channel, timeout_ms = timeout.as_millis() as u64))]
    pub async fn wait(self, timeout: Duration) -> Result<(), DeferredJobError> {
        let Self {
            broker,
            channel,
            initiator,
            listener,
        } = self;

        if timeout.is_zero() {
            return Err(DeferredJobError::InvalidTimeout);
        }
        let initiator = initiator.ok_or(DeferredJobError::MissingInitiator)?;
        let listener = listener.ok_or(DeferredJobError::MissingListener)?;

        let deadline = Instant::now() + timeout;

        // Only the first delivery fills the slot; later ones are dropped
        let (tx, rx) = oneshot::channel::<Message>();
        let slot = Mutex::new(Some(tx));
        let handler: MessageHandler =
            Arc::new(move |_channel: &str, message: &Message, _id: SubscriptionId| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(message.clone());
                }
            });

        let subscription = Subscription::open(broker, channel.clone(), handler).await?;
        let id = subscription.id();
        debug!(%id, "subscribed, starting initiator");

        let outcome = tokio::time::timeout_at(deadline, async {
            let mut initiate = initiator(channel.clone(), id);
            let mut rx = rx;
            // A delivered message beats an initiator still in flight
            tokio::select! {
                biased;
                message = &mut rx => {
                    detach_initiator(initiate, id);
                    message.map_err(|_| DeferredJobError::ChannelClosed(channel.clone()))
                }
                result = &mut initiate => {
                    result.map_err(DeferredJobError::Initiator)?;
                    rx.await
                        .map_err(|_| DeferredJobError::ChannelClosed(channel.clone()))
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(message)) => {
                subscription.release().await?;
                debug!(%id, "message received");
                listener(message).await.map_err(DeferredJobError::Listener)
            }
            Ok(Err(err)) => {
                release_quietly(&subscription).await;
                Err(err)
            }
            Err(_) => {
                release_quietly(&subscription).await;
                warn!(%id, "deferred job timed out");
                Err(DeferredJobError::Timeout { channel, timeout })
            }
        }
    }

    /// Publish `message` on `channel`
    pub async fn trigger(
        broker: &dyn MessageBroker,
        channel: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        broker.publish(channel, message).await
    }
}

impl fmt::Debug for DeferredJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredJob")
            .field("channel", &self.channel)
            .field("has_initiator", &self.initiator.is_some())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

/// Let an initiator outlive the wait once its message has arrived. The side
/// effect is not retracted, so it runs to completion in the background.
fn detach_initiator(initiate: BoxFuture<'static, anyhow::Result<()>>, id: SubscriptionId) {
    tokio::spawn(async move {
        if let Err(e) = initiate.await {
            warn!(%id, error = %e, "initiator failed after its message arrived");
        }
    });
}

/// Release on a failure path; the primary error wins over an unsubscribe error
async fn release_quietly(subscription: &Subscription) {
    if let Err(e) = subscription.release().await {
        warn!(
            channel = subscription.channel(),
            id = %subscription.id(),
            error = %e,
            "failed to release subscription"
        );
    }
}
