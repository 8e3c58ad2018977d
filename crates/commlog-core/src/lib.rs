//! # commlog-core
//!
//! Shared vocabulary for the commlog crates:
//!
//! - **Events**: [`Event`] with modified-property tracking for partial updates
//! - **Recipients**: phone-aware `(account, address)` identities with shared
//!   contact resolution state
//! - **Groups**: persisted message conversations
//! - **Filters**: storage [`EventFilter`]s and per-model [`FilterPolicy`] variants
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod event;
pub mod filter;
pub mod group;
pub mod logging;
pub mod phone;
pub mod recipient;

pub use event::{Direction, Event, EventStatus, EventType, INVALID_ID, Property, PropertySet};
pub use filter::{CallType, EventFilter, FilterPolicy};
pub use group::Group;
pub use recipient::{
    ContactInfo, ContactStatus, Recipient, RecipientKey, RecipientList, WeakRecipient,
};
