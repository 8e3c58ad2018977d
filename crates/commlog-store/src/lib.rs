//! # commlog-store
//!
//! `SQLite` storage gateway for communication events and conversation groups.
//!
//! The cache layer talks to storage only through the [`StorageGateway`]
//! trait; [`SqliteGateway`] is the production implementation, backed by an
//! `r2d2` pool with WAL mode so several processes can share one database.

#![deny(unsafe_code)]

pub mod errors;
pub mod gateway;
pub mod sqlite;

pub use errors::{Result, StoreError};
pub use gateway::{SqliteGateway, StorageGateway};
