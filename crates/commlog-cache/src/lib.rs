//! # commlog-cache
//!
//! In-memory views over stored communication events:
//!
//! - **Tree**: arena-backed [`EventTree`] with begin/end change notifications
//! - **Pipeline**: sync, async and streamed storage reads with stale-result
//!   discard
//! - **Grouping**: call rows rolled up by contact, time or type
//! - **Contacts**: shared, batched contact resolution
//! - **Bridge**: best-effort [`UpdateBus`] between models
//! - **Model**: [`EventModel`], the owner-driven consumer API tying it together
//! - **Context**: [`CommlogContext`], settings-driven wiring of the above

#![deny(unsafe_code)]

pub mod bridge;
pub mod contacts;
pub mod context;
pub mod errors;
pub mod grouping;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod tree;

pub use bridge::{BusEndpoint, BusEnvelope, BusMessage, Inbound, UpdateBus};
pub use contacts::{
    ContactCache, ContactResolver, ContactUpdate, Identity, IdentityChange, Resolution,
};
pub use context::CommlogContext;
pub use errors::{CacheError, ResolveError, Result};
pub use grouping::{CallGrouping, SortPolicy, UpdateOutcome};
pub use model::{EventModel, Layout};
pub use notify::{ModelNotification, Notifier};
pub use pipeline::{QueryMode, QueryWorker};
pub use tree::{EventTree, NodeId};
