//! Configuration type definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::core::TableDescriptor;
use crate::query::ResumePredicate;
use crate::retry::RetryPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration.
    pub source: SourceConfig,

    /// What to extract and how.
    pub extraction: ExtractionConfig,

    /// Retry and heartbeat settings.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Source database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    #[serde(default)]
    pub host: String,

    /// Combined `host[:port][/database]`, accepted in place of the separate fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Connect timeout in seconds (default: 15).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Tables to read and how to page through them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Tables in extraction order, as `schema.table`.
    pub tables: Vec<TableDescriptor>,

    /// Rows per fetch (default: 5000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Restrict every table to a range of one column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalConfig>,

    /// Comparison used when resuming on a composite key.
    #[serde(default)]
    pub resume_predicate: ResumePredicate,

    /// Move on to the next table when one does not exist.
    #[serde(default)]
    pub skip_missing_tables: bool,
}

/// Incremental column and optional lower bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    pub column: String,

    /// Lower bound; numbers and booleans are taken as their text form.
    #[serde(
        default,
        deserialize_with = "deserialize_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<String>,
}

/// Retry policy and heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per database call (default: 5).
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// First backoff delay in milliseconds (default: 2000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff growth factor (default: 2.0).
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Backoff ceiling in milliseconds (default: 300000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Seconds between "still running" reports, 0 disables (default: 180).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            heartbeat_interval_secs: default_heartbeat_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_tries: self.max_tries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn deserialize_scalar<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_yaml::Value;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "incremental value must be a scalar, got {:?}",
            other
        ))),
    }
}

fn default_pg_port() -> u16 {
    5432
}

fn default_require() -> String {
    "require".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_batch_size() -> usize {
    5000
}

fn default_max_tries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_heartbeat_secs() -> u64 {
    180
}
