//! Persisted message conversation groups.
//!
//! Groups collect message events by local account and recipients. Calls are
//! groupless; call grouping is a view-level concept handled by the cache.

use chrono::{DateTime, Utc};

use crate::event::INVALID_ID;
use crate::recipient::RecipientList;

/// A conversation group.
#[derive(Clone, Debug)]
pub struct Group {
    /// Storage id, [`INVALID_ID`] until stored.
    pub id: i32,
    /// Local account.
    pub local_uid: String,
    /// Remote participants.
    pub recipients: RecipientList,
    /// Chat name for multi-user conversations.
    pub chat_name: String,
    /// Id of the newest event in the group.
    pub last_event_id: i32,
    /// Last time the group or one of its events changed.
    pub last_modified: DateTime<Utc>,
}

impl Group {
    /// New, unstored group.
    pub fn new(local_uid: impl Into<String>, recipients: RecipientList) -> Self {
        Self {
            id: INVALID_ID,
            local_uid: local_uid.into(),
            recipients,
            chat_name: String::new(),
            last_event_id: INVALID_ID,
            last_modified: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Whether the group has been stored.
    pub fn is_valid(&self) -> bool {
        self.id >= 0
    }
}
