//! In-memory implementation of KeyValueStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::store::*;

/// In-memory implementation of KeyValueStore
///
/// This is primarily for testing. Values are cloned in and out, so a record
/// read back is a snapshot of what was last written, the same as with the
/// PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use authlink_durable::InMemoryKeyValueStore;
///
/// let store = InMemoryKeyValueStore::new();
/// assert!(store.is_empty());
/// ```
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, Value>>,
    writes: AtomicUsize,
}

impl InMemoryKeyValueStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Get the number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Check if a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Total number of successful `set` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = InMemoryKeyValueStore::new();

        let value = store.get("missing").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryKeyValueStore::new();

        store
            .set("consent-1", json!({"currentState": "start", "x": 1}))
            .await
            .unwrap();

        let value = store.get("consent-1").await.unwrap();
        assert_eq!(value, Some(json!({"currentState": "start", "x": 1})));
        assert!(store.contains("consent-1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = InMemoryKeyValueStore::new();

        store.set("k", json!({"v": 1})).await.unwrap();
        store.set("k", json!({"v": 2})).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(json!({"v": 2})));
        assert_eq!(store.len(), 1);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = InMemoryKeyValueStore::new();
        store.set("a", json!(1)).await.unwrap();
        store.set("b", json!(2)).await.unwrap();

        store.clear();

        assert!(store.is_empty());
        assert!(store.get("a").await.unwrap().is_none());
    }
}
