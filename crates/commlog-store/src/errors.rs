//! Error types for the storage gateway.
//!
//! [`StoreError`] is returned by every gateway and repository operation.
//! Not-found conditions on reads are `Ok(None)`, not errors; the not-found
//! variants here are for writes that target a missing row.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error (recipient lists).
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Write targeted an event that does not exist.
    #[error("event not found: {0}")]
    EventNotFound(i32),

    /// Write targeted a group that does not exist.
    #[error("group not found: {0}")]
    GroupNotFound(i32),

    /// A bulk add contained an event that is already stored; nothing was
    /// committed.
    #[error("duplicate event (matches stored event {existing_id})")]
    DuplicateEvent {
        /// Id of the stored event the new one duplicates.
        existing_id: i32,
    },

    /// Invalid operation (e.g. modifying an unstored event).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Convenience type alias for storage results.
pub type Result<T> = std::result::Result<T, StoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
