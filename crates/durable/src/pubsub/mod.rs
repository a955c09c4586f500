//! Publish/subscribe messaging used to correlate callbacks with waiting workflows
//!
//! This module provides:
//! - [`MessageBroker`] trait for channel-based fan-out messaging
//! - [`InMemoryBroker`] for testing and single-process deployments
//! - [`PostgresBroker`] backed by PostgreSQL `LISTEN/NOTIFY`

mod broker;
mod memory;
mod postgres;

pub use broker::{BrokerError, Message, MessageBroker, MessageHandler, SubscriptionId};
pub use memory::InMemoryBroker;
pub use postgres::PostgresBroker;
