//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may specify any subset of fields.

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "database": { "path": "/var/lib/commlog/events.db" },
///   "query": { "mode": "streamed", "firstChunkSize": 25 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommlogSettings {
    /// Storage settings.
    pub database: DatabaseSettings,
    /// Query pipeline defaults for new models.
    pub query: QuerySettings,
    /// Contact resolution settings.
    pub contacts: ContactSettings,
    /// Update bus settings.
    pub bus: BusSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// `SQLite` storage settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Database file path.
    pub path: String,
    /// Maximum connection pool size.
    pub pool_size: u32,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Page cache size in KiB.
    pub cache_size_kib: i64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            path: format!("{home}/.commlog/events.db"),
            pool_size: 4,
            busy_timeout_ms: 30_000,
            cache_size_kib: 8192,
        }
    }
}

/// How a model executes its storage reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryModeSetting {
    /// Block the caller.
    Sync,
    /// One background fetch, one ready notification.
    #[default]
    Async,
    /// Background fetch in chunks.
    Streamed,
}

/// Query pipeline settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuerySettings {
    /// Default execution mode.
    pub mode: QueryModeSetting,
    /// Rows in the first streamed chunk.
    pub first_chunk_size: usize,
    /// Rows in each later streamed chunk.
    pub chunk_size: usize,
    /// Run storage reads on a dedicated worker thread instead of the
    /// runtime's blocking pool.
    pub dedicated_worker: bool,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            mode: QueryModeSetting::Async,
            first_chunk_size: 50,
            chunk_size: 200,
            dedicated_worker: false,
        }
    }
}

/// Contact resolution settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactSettings {
    /// Whether models resolve recipients at all.
    pub enabled: bool,
    /// Maximum keys drained per resolution batch.
    pub batch_size: usize,
}

impl Default for ContactSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 64,
        }
    }
}

/// Update bus settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Broadcast channel capacity; slower receivers lag and refetch.
    pub capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
