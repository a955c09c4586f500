//! PostgreSQL implementation of KeyValueStore
//!
//! Workflow records are stored as JSONB documents in a single table:
//!
//! ```sql
//! CREATE TABLE durable_kv (
//!     key        TEXT PRIMARY KEY,
//!     value      JSONB NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::config::EngineConfig;

/// Default table name for the key-value store
pub const DEFAULT_KV_TABLE: &str = "durable_kv";

/// PostgreSQL implementation of KeyValueStore
///
/// # Example
///
/// ```ignore
/// use authlink_durable::PostgresKeyValueStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresKeyValueStore::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresKeyValueStore {
    pool: PgPool,
    table: String,
}

impl PostgresKeyValueStore {
    /// Create a store using the default `durable_kv` table
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_KV_TABLE.to_string(),
        }
    }

    /// Create a store using a custom table name
    ///
    /// The name is interpolated into SQL, so only ASCII letters, digits and
    /// underscores are accepted.
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(StoreError::Database(format!(
                "invalid table name: {table:?}"
            )));
        }
        Ok(Self { pool, table })
    }

    /// Connect using `DATABASE_URL` and table name from the engine config
    pub async fn connect(config: &EngineConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Database("DATABASE_URL is not set".to_string()))?;

        let pool = PgPool::connect(url).await.map_err(|e| {
            error!("Failed to connect to PostgreSQL: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Self::with_table(pool, config.kv_table.clone())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the backing table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the backing table if it does not exist
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                key        TEXT PRIMARY KEY,
                value      JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        );

        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to create key-value table: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for PostgresKeyValueStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let query = format!("SELECT value FROM {} WHERE key = $1", self.table);

        let row = sqlx::query(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to read key: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(row.map(|r| r.get::<Value, _>("value")))
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let query = format!(
            r#"
            INSERT INTO {} (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
            self.table
        );

        sqlx::query(&query)
            .bind(key)
            .bind(&value)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to write key: {}", e);
                StoreError::Database(e.to_string())
            })?;

        debug!(%key, "stored value");
        Ok(())
    }
}

fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("durable_kv"));
        assert!(is_valid_identifier("_kv2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2kv"));
        assert!(!is_valid_identifier("kv; DROP TABLE users"));
        assert!(!is_valid_identifier(&"a".repeat(64)));
    }
}
