//! Event database schema versions.
//!
//! Each step's SQL is compiled in and runs in its own transaction together
//! with its `schema_version` row, so a crash mid-step leaves the previous
//! version intact and the next open retries it.

use rusqlite::{Connection, params};
use tracing::info;

use crate::errors::{Result, StoreError};

/// `(version, description, sql)`, ascending by version.
const STEPS: &[(u32, &str, &str)] = &[(
    1,
    "events and groups with query indexes",
    include_str!("v001_schema.sql"),
)];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT    NOT NULL,
    description TEXT
)";

fn migration_error(context: impl std::fmt::Display, err: &rusqlite::Error) -> StoreError {
    StoreError::Migration {
        message: format!("{context}: {err}"),
    }
}

/// Bring `conn` up to [`latest_version`]. Returns how many steps ran.
///
/// # Errors
///
/// [`StoreError::Migration`] naming the step that failed.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    conn.execute_batch(VERSION_TABLE)
        .map_err(|e| migration_error("schema_version", &e))?;
    let from = current_version(conn)?;

    let mut ran = 0;
    for &(version, description, sql) in STEPS.iter().filter(|(v, ..)| *v > from) {
        info!(version, description, "migrating event database");
        let step = |e: rusqlite::Error| migration_error(format_args!("v{version:03}"), &e);
        let tx = conn.unchecked_transaction().map_err(step)?;
        tx.execute_batch(sql).map_err(step)?;
        let _ = tx
            .execute(
                "INSERT INTO schema_version (version, applied_at, description)
                 VALUES (?1, datetime('now'), ?2)",
                params![version, description],
            )
            .map_err(step)?;
        tx.commit().map_err(step)?;
        ran += 1;
    }
    Ok(ran)
}

/// Version recorded in `schema_version`, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| migration_error("schema_version", &e))
}

/// Newest version this build knows.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |(version, ..)| *version)
}
