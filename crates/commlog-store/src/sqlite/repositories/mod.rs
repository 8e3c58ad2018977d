//! Repository implementations for `SQLite` database operations.
//!
//! Each repository is a stateless struct whose methods take a `&Connection`,
//! so they run equally well on a pooled connection or inside a transaction.

pub mod event;
pub mod group;

pub use event::EventRepo;
pub use group::GroupRepo;
