//! KeyValueStore trait definition

use async_trait::async_trait;
use serde_json::Value;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Durable key-value storage for workflow state records
///
/// The engine treats values as opaque JSON documents. It only ever reads a
/// record when a workflow is reloaded and only writes one when the caller
/// explicitly asks for it; retention and eviction belong to the
/// implementation.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read the value stored under `key`, or `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}
