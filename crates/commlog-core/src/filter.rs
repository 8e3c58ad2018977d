//! Storage query filters and per-model acceptance policies.
//!
//! [`EventFilter`] is what the storage gateway executes. [`FilterPolicy`]
//! decides whether an event belongs in a given model; it is a closed set of
//! variants so models stay data-driven and the policy can be tested without
//! a tree. Each policy also knows the [`EventFilter`] that fetches exactly
//! the events it accepts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Direction, Event, EventType};
use crate::phone::remote_addresses_match;

/// Parameters of a storage read. Results are ordered newest first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventFilter {
    /// Accept only these types (empty = any type).
    pub event_types: Vec<EventType>,
    /// Local account.
    pub local_uid: Option<String>,
    /// Direction.
    pub direction: Option<Direction>,
    /// Owning group.
    pub group_id: Option<i32>,
    /// Missed-call flag.
    pub is_missed_call: Option<bool>,
    /// Draft flag.
    pub is_draft: Option<bool>,
    /// Read flag.
    pub is_read: Option<bool>,
    /// Any recipient matching this address (phone aware).
    pub remote_uid: Option<String>,
    /// Start time strictly after.
    pub start_after: Option<DateTime<Utc>>,
    /// Start time strictly before.
    pub start_before: Option<DateTime<Utc>>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: Option<usize>,
}

impl EventFilter {
    /// Filter on a set of event types.
    pub fn types(event_types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            event_types: event_types.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Copy with a row window.
    #[must_use]
    pub fn with_window(mut self, limit: Option<usize>, offset: Option<usize>) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Evaluate every predicate except the row window.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type()) {
            return false;
        }
        if self.local_uid.as_deref().is_some_and(|uid| uid != event.local_uid()) {
            return false;
        }
        if self.direction.is_some_and(|d| d != event.direction()) {
            return false;
        }
        if self.group_id.is_some_and(|g| g != event.group_id()) {
            return false;
        }
        if self.is_missed_call.is_some_and(|m| m != event.is_missed_call()) {
            return false;
        }
        if self.is_draft.is_some_and(|d| d != event.is_draft()) {
            return false;
        }
        if self.is_read.is_some_and(|r| r != event.is_read()) {
            return false;
        }
        if let Some(remote) = self.remote_uid.as_deref() {
            if !event
                .recipients()
                .iter()
                .any(|r| remote_addresses_match(r.remote_uid(), remote))
            {
                return false;
            }
        }
        if self.start_after.is_some_and(|t| event.start_time() <= t) {
            return false;
        }
        if self.start_before.is_some_and(|t| event.start_time() >= t) {
            return false;
        }
        true
    }
}

/// Call list type filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallType {
    /// Every call.
    #[default]
    All,
    /// Outbound calls.
    Dialed,
    /// Answered inbound calls.
    Received,
    /// Missed inbound calls.
    Missed,
}

impl CallType {
    /// Whether a call event is of this type.
    pub fn accepts(self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Dialed => event.direction() == Direction::Outbound,
            Self::Received => event.direction() == Direction::Inbound && !event.is_missed_call(),
            Self::Missed => event.direction() == Direction::Inbound && event.is_missed_call(),
        }
    }
}

/// Which events a model shows.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum FilterPolicy {
    /// Everything.
    #[default]
    All,
    /// Only the given types.
    EventTypes(Vec<EventType>),
    /// Calls, optionally narrowed by type, account and a time floor.
    Calls {
        /// Call type.
        call_type: CallType,
        /// Local account.
        local_uid: Option<String>,
        /// Only calls that started after this instant.
        after: Option<DateTime<Utc>>,
    },
    /// Unsent drafts.
    Drafts,
    /// Events of one conversation group.
    Group(i32),
    /// Unread events.
    Unread,
}

impl FilterPolicy {
    /// Every call.
    pub fn all_calls() -> Self {
        Self::Calls {
            call_type: CallType::All,
            local_uid: None,
            after: None,
        }
    }

    /// Whether `event` belongs in a model using this policy.
    pub fn accepts(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::EventTypes(types) => types.contains(&event.event_type()),
            Self::Calls {
                call_type,
                local_uid,
                after,
            } => {
                event.is_call()
                    && call_type.accepts(event)
                    && local_uid.as_deref().is_none_or(|uid| uid == event.local_uid())
                    && after.is_none_or(|t| event.start_time() > t)
            }
            Self::Drafts => event.is_draft(),
            Self::Group(group_id) => event.group_id() == *group_id,
            Self::Unread => !event.is_read(),
        }
    }

    /// Storage filter fetching the events this policy accepts.
    pub fn to_filter(&self) -> EventFilter {
        match self {
            Self::All => EventFilter::default(),
            Self::EventTypes(types) => EventFilter::types(types.iter().copied()),
            Self::Calls {
                call_type,
                local_uid,
                after,
            } => {
                let mut filter = EventFilter::types([EventType::Call]);
                filter.local_uid.clone_from(local_uid);
                filter.start_after = *after;
                match call_type {
                    CallType::All => {}
                    CallType::Dialed => filter.direction = Some(Direction::Outbound),
                    CallType::Received => {
                        filter.direction = Some(Direction::Inbound);
                        filter.is_missed_call = Some(false);
                    }
                    CallType::Missed => {
                        filter.direction = Some(Direction::Inbound);
                        filter.is_missed_call = Some(true);
                    }
                }
                filter
            }
            Self::Drafts => EventFilter {
                is_draft: Some(true),
                ..EventFilter::default()
            },
            Self::Group(group_id) => EventFilter {
                group_id: Some(*group_id),
                ..EventFilter::default()
            },
            Self::Unread => EventFilter {
                is_read: Some(false),
                ..EventFilter::default()
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
