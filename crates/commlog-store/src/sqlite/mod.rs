//! `SQLite` backend for the storage gateway.
//!
//! - **[`connection`]**: `r2d2` pool with WAL mode and foreign keys on every
//!   connection.
//! - **[`migrations`]**: version-tracked schema, embedded at compile time.
//! - **[`repositories`]**: stateless repositories over `&Connection`.

pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{
    new_file, new_in_memory, verify_pragmas, ConnectionConfig, ConnectionPool, PooledConnection,
    PragmaState,
};
pub use migrations::{current_version, latest_version, run_migrations};
