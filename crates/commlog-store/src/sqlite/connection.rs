//! Pooled `SQLite` connections for the event database.
//!
//! Several processes open the same event database at once, so every pooled
//! connection is switched to WAL with a busy timeout before first use.
//! Foreign keys are on so deleting a group cascades to its events.

use std::time::Duration;

use commlog_settings::DatabaseSettings;
use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::Result;

/// Pool of event database connections.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// One checked-out connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool and pragma tuning, normally derived from [`DatabaseSettings`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Connections kept by a file-backed pool.
    pub pool_size: u32,
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u32,
    /// Page cache per connection, in KiB.
    pub cache_size_kib: i64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&DatabaseSettings::default())
    }
}

impl From<&DatabaseSettings> for ConnectionConfig {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            pool_size: settings.pool_size.max(1),
            busy_timeout_ms: settings.busy_timeout_ms,
            cache_size_kib: settings.cache_size_kib,
        }
    }
}

impl ConnectionConfig {
    fn pragmas(&self) -> String {
        format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA foreign_keys = ON;\
             PRAGMA cache_size = -{};\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms, self.cache_size_kib
        )
    }
}

#[derive(Debug)]
struct EventDbSetup {
    pragmas: String,
}

impl CustomizeConnection<Connection, rusqlite::Error> for EventDbSetup {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&self.pragmas)
    }
}

fn build(
    manager: SqliteConnectionManager,
    max_size: u32,
    config: &ConnectionConfig,
) -> Result<ConnectionPool> {
    let mut builder = Pool::builder()
        .max_size(max_size)
        .connection_timeout(CHECKOUT_TIMEOUT)
        .connection_customizer(Box::new(EventDbSetup {
            pragmas: config.pragmas(),
        }));
    if max_size == 1 {
        // A private in-memory database lives exactly as long as its only
        // connection.
        builder = builder.idle_timeout(None).max_lifetime(None);
    }
    Ok(builder.build(manager)?)
}

/// Pool over a private in-memory database. Holds a single connection.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    build(SqliteConnectionManager::memory(), 1, config)
}

/// Pool over the database file at `path`, created if missing.
pub fn new_file(path: &str, config: &ConnectionConfig) -> Result<ConnectionPool> {
    build(SqliteConnectionManager::file(path), config.pool_size, config)
}

/// Pragmas actually in effect on a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PragmaState {
    /// `wal` for files, `memory` for in-memory databases.
    pub journal_mode: String,
    /// Whether foreign keys are enforced.
    pub foreign_keys_enabled: bool,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
}

/// Read back the pragmas set on `conn`.
pub fn verify_pragmas(conn: &Connection) -> Result<PragmaState> {
    let pragma = |name: &str| -> rusqlite::Result<rusqlite::types::Value> {
        conn.query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))
    };
    let journal_mode = match pragma("journal_mode")? {
        rusqlite::types::Value::Text(mode) => mode.to_lowercase(),
        _ => String::new(),
    };
    let as_int = |value: rusqlite::types::Value| match value {
        rusqlite::types::Value::Integer(n) => n,
        _ => 0,
    };
    Ok(PragmaState {
        journal_mode,
        foreign_keys_enabled: as_int(pragma("foreign_keys")?) == 1,
        busy_timeout_ms: as_int(pragma("busy_timeout")?) as u32,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
