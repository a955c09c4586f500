//! Persistence layer for workflow state records
//!
//! This module provides:
//! - [`KeyValueStore`] trait for durable get/set of opaque JSON records
//! - [`InMemoryKeyValueStore`] for testing
//! - [`PostgresKeyValueStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryKeyValueStore;
pub use postgres::{PostgresKeyValueStore, DEFAULT_KV_TABLE};
pub use store::{KeyValueStore, StoreError};
