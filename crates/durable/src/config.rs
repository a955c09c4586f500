// Engine configuration
//
// Loaded from environment variables, optionally seeded from a `.env` file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persistence::DEFAULT_KV_TABLE;

/// Default bound for a deferred job wait
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the durable engine and its PostgreSQL adapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout used by `DeferredJob::wait_default`
    #[serde(with = "duration_millis")]
    pub default_wait_timeout: Duration,

    /// PostgreSQL connection string for the KVS and broker adapters
    pub database_url: Option<String>,

    /// Table backing `PostgresKeyValueStore`
    pub kv_table: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout: DEFAULT_WAIT_TIMEOUT,
            database_url: None,
            kv_table: DEFAULT_KV_TABLE.to_string(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DEFERRED_WAIT_TIMEOUT_MS`: default deferred job timeout (default: 30000)
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `DURABLE_KV_TABLE`: key-value table name (default: durable_kv)
    pub fn from_env() -> Self {
        let default_wait_timeout = std::env::var("DEFERRED_WAIT_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WAIT_TIMEOUT);

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.is_empty());

        let kv_table =
            std::env::var("DURABLE_KV_TABLE").unwrap_or_else(|_| DEFAULT_KV_TABLE.to_string());

        Self {
            default_wait_timeout,
            database_url,
            kv_table,
        }
    }

    /// Load a `.env` file if present, then read the environment
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Set the default deferred job timeout
    pub fn with_default_wait_timeout(mut self, timeout: Duration) -> Self {
        self.default_wait_timeout = timeout;
        self
    }

    /// Set the database URL
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Set the key-value table name
    pub fn with_kv_table(mut self, table: impl Into<String>) -> Self {
        self.kv_table = table.into();
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 3] = ["DEFERRED_WAIT_TIMEOUT_MS", "DATABASE_URL", "DURABLE_KV_TABLE"];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    // One test so the cases never race each other on the process environment
    #[test]
    fn test_from_env() {
        clear_env();
        assert_eq!(EngineConfig::from_env(), EngineConfig::default());

        std::env::set_var("DEFERRED_WAIT_TIMEOUT_MS", "1500");
        std::env::set_var("DATABASE_URL", "postgres://localhost/authlink");
        std::env::set_var("DURABLE_KV_TABLE", "consent_kv");
        let config = EngineConfig::from_env();
        assert_eq!(config.default_wait_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/authlink")
        );
        assert_eq!(config.kv_table, "consent_kv");

        // Zero, garbage and empty values fall back to the defaults
        std::env::set_var("DEFERRED_WAIT_TIMEOUT_MS", "0");
        std::env::set_var("DATABASE_URL", "");
        assert_eq!(EngineConfig::from_env().default_wait_timeout, DEFAULT_WAIT_TIMEOUT);
        assert_eq!(EngineConfig::from_env().database_url, None);

        std::env::set_var("DEFERRED_WAIT_TIMEOUT_MS", "abc");
        assert_eq!(EngineConfig::from_env().default_wait_timeout, DEFAULT_WAIT_TIMEOUT);

        clear_env();
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_wait_timeout, Duration::from_secs(30));
        assert!(config.database_url.is_none());
        assert_eq!(config.kv_table, "durable_kv");
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::default()
            .with_default_wait_timeout(Duration::from_millis(500))
            .with_database_url("postgres://localhost/authlink")
            .with_kv_table("consent_kv");

        assert_eq!(config.default_wait_timeout, Duration::from_millis(500));
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/authlink")
        );
        assert_eq!(config.kv_table, "consent_kv");
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::default().with_default_wait_timeout(Duration::from_millis(1500));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["default_wait_timeout"], 1500);

        let parsed: EngineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
