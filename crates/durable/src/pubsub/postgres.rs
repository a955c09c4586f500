//! PostgreSQL `LISTEN/NOTIFY` implementation of MessageBroker
//!
//! Callbacks for a workflow may arrive at a different process than the one
//! waiting on them, so the broker has to be shared. PostgreSQL notifications
//! give every process listening on a channel a copy of each message:
//! - one dedicated listener connection per broker, owned by a background task
//! - `LISTEN` is issued when a channel gains its first local subscriber and
//!   `UNLISTEN` when it loses its last one
//! - changes to a channel's subscriber list and the matching LISTEN/UNLISTEN
//!   round trip are serialized per channel, so `subscribe` returns only once
//!   the connection is listening
//! - `publish` is `SELECT pg_notify(channel, json)`
//!
//! PostgreSQL limits notification payloads to 8000 bytes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

use super::broker::*;

type Subscribers = DashMap<String, Vec<(SubscriptionId, MessageHandler)>>;

/// Per-channel locks held across a subscriber change and its LISTEN/UNLISTEN
#[derive(Default)]
struct ChannelGates {
    gates: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl ChannelGates {
    async fn lock(&self, channel: &str) -> GateGuard<'_> {
        let gate = self.gates.entry(channel.to_string()).or_default().clone();
        GateGuard {
            gates: self,
            channel: channel.to_string(),
            guard: Some(gate.lock_owned().await),
        }
    }

    fn len(&self) -> usize {
        self.gates.len()
    }
}

/// Unlocks the channel and forgets its gate when nobody else holds it
struct GateGuard<'a> {
    gates: &'a ChannelGates,
    channel: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.gates
            .gates
            .remove_if(&self.channel, |_, gate| Arc::strong_count(gate) == 1);
    }
}

/// Commands sent to the listener task
enum ListenerCommand {
    Listen(String, oneshot::Sender<Result<(), BrokerError>>),
    Unlisten(String, oneshot::Sender<Result<(), BrokerError>>),
    Shutdown,
}

/// PostgreSQL implementation of MessageBroker
///
/// # Example
///
/// ```ignore
/// use authlink_durable::{MessageBroker, PostgresBroker};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let broker = PostgresBroker::new(pool);
/// broker.connect().await?;
/// ```
pub struct PostgresBroker {
    pool: PgPool,
    subscribers: Arc<Subscribers>,
    gates: ChannelGates,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    commands: Mutex<Option<mpsc::UnboundedSender<ListenerCommand>>>,
}

impl PostgresBroker {
    /// Create a disconnected broker; call [`MessageBroker::connect`] before use
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            subscribers: Arc::new(DashMap::new()),
            gates: ChannelGates::default(),
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
            commands: Mutex::new(None),
        }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn send_command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), BrokerError>>) -> ListenerCommand,
    ) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let commands = self.commands.lock();
            let tx = commands.as_ref().ok_or(BrokerError::NotConnected)?;
            tx.send(make(reply_tx))
                .map_err(|_| BrokerError::NotConnected)?;
        }
        reply_rx.await.map_err(|_| BrokerError::NotConnected)?
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

#[async_trait]
impl MessageBroker for PostgresBroker {
    #[instrument(skip(self))]
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            return Ok(());
        }

        let listener = PgListener::connect_with(&self.pool).await.map_err(|e| {
            error!("Failed to open listener connection: {}", e);
            BrokerError::Transport(e.to_string())
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);

        tokio::spawn(run_listener(
            listener,
            rx,
            self.subscribers.clone(),
            self.connected.clone(),
        ));

        info!("postgres broker connected");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn disconnect(&self) -> Result<(), BrokerError> {
        let tx = self.commands.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(ListenerCommand::Shutdown);
        }
        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.clear();
        info!("postgres broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<bool, BrokerError> {
        if !self.is_connected() {
            return Ok(false);
        }

        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(error = %e, "broker ping failed");
                Ok(false)
            }
        }
    }

    #[instrument(skip(self, message))]
    async fn publish(&self, channel: &str, message: Message) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let payload = serde_json::to_string(&message)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to publish notification: {}", e);
                BrokerError::Transport(e.to_string())
            })?;

        debug!(%channel, bytes = payload.len(), "published notification");
        Ok(())
    }

    #[instrument(skip(self, handler))]
    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, BrokerError> {
        self.ensure_connected()?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let _gate = self.gates.lock(channel).await;

        let first = {
            let mut subs = self.subscribers.entry(channel.to_string()).or_default();
            subs.push((id, handler));
            subs.len() == 1
        };

        // Later subscribers only get here once this LISTEN has been acknowledged
        if first {
            let channel_name = channel.to_string();
            if let Err(e) = self
                .send_command(|reply| ListenerCommand::Listen(channel_name, reply))
                .await
            {
                if let Some(mut subs) = self.subscribers.get_mut(channel) {
                    subs.retain(|(sid, _)| *sid != id);
                }
                self.subscribers.remove_if(channel, |_, subs| subs.is_empty());
                return Err(e);
            }
        }

        debug!(%channel, %id, "subscribed");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let _gate = self.gates.lock(channel).await;

        let (removed, now_empty) = match self.subscribers.get_mut(channel) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|(sid, _)| *sid != id);
                (before != subs.len(), subs.is_empty())
            }
            None => (false, false),
        };

        if !removed {
            return Err(BrokerError::UnknownSubscription {
                channel: channel.to_string(),
                id,
            });
        }

        if now_empty && self.subscribers.remove_if(channel, |_, subs| subs.is_empty()).is_some() {
            let channel_name = channel.to_string();
            self.send_command(|reply| ListenerCommand::Unlisten(channel_name, reply))
                .await?;
        }

        debug!(%channel, %id, "unsubscribed");
        Ok(())
    }
}

impl Drop for PostgresBroker {
    fn drop(&mut self) {
        if let Some(tx) = self.commands.lock().take() {
            let _ = tx.send(ListenerCommand::Shutdown);
        }
    }
}

/// Owns the listener connection: applies LISTEN/UNLISTEN commands and fans
/// incoming notifications out to local handlers
async fn run_listener(
    mut listener: PgListener,
    mut commands: mpsc::UnboundedReceiver<ListenerCommand>,
    subscribers: Arc<Subscribers>,
    connected: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ListenerCommand::Listen(channel, reply)) => {
                    let result = listener
                        .listen(&channel)
                        .await
                        .map_err(|e| BrokerError::Transport(e.to_string()));
                    let _ = reply.send(result);
                }
                Some(ListenerCommand::Unlisten(channel, reply)) => {
                    let result = listener
                        .unlisten(&channel)
                        .await
                        .map_err(|e| BrokerError::Transport(e.to_string()));
                    let _ = reply.send(result);
                }
                Some(ListenerCommand::Shutdown) | None => break,
            },
            notification = listener.recv() => match notification {
                Ok(notification) => {
                    dispatch(&subscribers, notification.channel(), notification.payload());
                }
                Err(e) => {
                    error!(error = %e, "listener connection failed");
                    fail_listener(&subscribers, &connected);
                    break;
                }
            },
        }
    }

    debug!("listener task stopped");
}

/// Mark the broker disconnected and drop every local handler, so pending
/// waits see their channel close instead of running out their deadline
fn fail_listener(subscribers: &Subscribers, connected: &AtomicBool) {
    connected.store(false, Ordering::SeqCst);
    subscribers.clear();
}

fn dispatch(subscribers: &Subscribers, channel: &str, payload: &str) {
    let message: Message = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(%channel, error = %e, "dropping notification with invalid JSON payload");
            return;
        }
    };

    let handlers: Vec<(SubscriptionId, MessageHandler)> = subscribers
        .get(channel)
        .map(|subs| subs.value().clone())
        .unwrap_or_default();

    for (id, handler) in handlers {
        handler(channel, &message, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_decodes_json_payload() {
        let subscribers: Subscribers = DashMap::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |channel: &str, message: &Message, id: SubscriptionId| {
            sink.lock().push((channel.to_string(), message.clone(), id));
        });
        subscribers.insert("verify-1".to_string(), vec![(SubscriptionId(7), handler)]);

        dispatch(&subscribers, "verify-1", r#"{"status":"VERIFIED"}"#);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "verify-1");
        assert_eq!(seen[0].1, json!({"status": "VERIFIED"}));
        assert_eq!(seen[0].2, SubscriptionId(7));
    }

    #[test]
    fn test_dispatch_skips_invalid_payload() {
        let subscribers: Subscribers = DashMap::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let handler: MessageHandler = Arc::new(move |_: &str, _: &Message, _: SubscriptionId| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subscribers.insert("c".to_string(), vec![(SubscriptionId(1), handler)]);

        dispatch(&subscribers, "c", "not json");
        dispatch(&subscribers, "other", "1");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_failure_closes_pending_waits() {
        let subscribers: Subscribers = DashMap::new();
        let connected = AtomicBool::new(true);
        let (tx, mut rx) = oneshot::channel::<Message>();
        let slot = Mutex::new(Some(tx));
        let handler: MessageHandler = Arc::new(move |_: &str, message: &Message, _: SubscriptionId| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(message.clone());
            }
        });
        subscribers.insert("verify-1".to_string(), vec![(SubscriptionId(1), handler)]);

        fail_listener(&subscribers, &connected);

        assert!(!connected.load(Ordering::SeqCst));
        assert!(subscribers.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_channel_gate_serializes_changes() {
        let gates = Arc::new(ChannelGates::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = gates.lock("verify-1").await;

        let (waiting_gates, waiting_order) = (gates.clone(), order.clone());
        let second = tokio::spawn(async move {
            let _gate = waiting_gates.lock("verify-1").await;
            waiting_order.lock().push("second");
        });

        // Another channel is not blocked
        drop(gates.lock("verify-2").await);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        order.lock().push("first");
        drop(first);

        second.await.unwrap();
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(gates.len(), 0);
    }
}
