//! The [`Event`] value type: one message or call record.
//!
//! Every setter records the touched field in the event's modified property
//! set. Partial updates (to storage and to cached copies) copy exactly those
//! fields; see [`Event::copy_valid_properties`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recipient::{ContactInfo, RecipientList};

/// Id of an event that has not been stored yet.
pub const INVALID_ID: i32 = -1;

/// Kind of communication event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    /// Unknown or unset.
    #[default]
    Unknown,
    /// Instant message.
    Im,
    /// SMS.
    Sms,
    /// Voice or video call.
    Call,
    /// Voicemail notification.
    Voicemail,
    /// Presence/status message.
    StatusMessage,
    /// Class-zero ("flash") SMS.
    ClassZeroSms,
    /// MMS.
    Mms,
}

impl EventType {
    /// Storage representation.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Im => 1,
            Self::Sms => 2,
            Self::Call => 3,
            Self::Voicemail => 4,
            Self::StatusMessage => 5,
            Self::ClassZeroSms => 6,
            Self::Mms => 7,
        }
    }

    /// Parse the storage representation; unknown values map to `Unknown`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Im,
            2 => Self::Sms,
            3 => Self::Call,
            4 => Self::Voicemail,
            5 => Self::StatusMessage,
            6 => Self::ClassZeroSms,
            7 => Self::Mms,
            _ => Self::Unknown,
        }
    }

    /// Message-like events (everything that belongs to a conversation group).
    pub fn is_message(self) -> bool {
        matches!(self, Self::Im | Self::Sms | Self::Mms | Self::ClassZeroSms)
    }
}

/// Direction of an event relative to the local account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Unknown or unset.
    #[default]
    Unknown,
    /// Received.
    Inbound,
    /// Sent / dialed.
    Outbound,
}

impl Direction {
    /// Storage representation.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Inbound => 1,
            Self::Outbound => 2,
        }
    }

    /// Parse the storage representation.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Inbound,
            2 => Self::Outbound,
            _ => Self::Unknown,
        }
    }
}

/// Delivery status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventStatus {
    /// Unknown or unset.
    #[default]
    Unknown,
    /// Queued for sending.
    Sending,
    /// Handed to the transport.
    Sent,
    /// Delivery confirmed.
    Delivered,
    /// Failed, will be retried.
    TemporarilyFailed,
    /// Failed for good.
    PermanentlyFailed,
}

impl EventStatus {
    /// Storage representation.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Sending => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
            Self::TemporarilyFailed => 4,
            Self::PermanentlyFailed => 5,
        }
    }

    /// Parse the storage representation.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Sending,
            2 => Self::Sent,
            3 => Self::Delivered,
            4 => Self::TemporarilyFailed,
            5 => Self::PermanentlyFailed,
            _ => Self::Unknown,
        }
    }
}

/// A single event field, as tracked by [`PropertySet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Property {
    /// [`Event::id`]
    Id = 0,
    /// [`Event::event_type`]
    Type,
    /// [`Event::start_time`]
    StartTime,
    /// [`Event::end_time`]
    EndTime,
    /// [`Event::direction`]
    Direction,
    /// [`Event::is_draft`]
    IsDraft,
    /// [`Event::is_read`]
    IsRead,
    /// [`Event::is_missed_call`]
    IsMissedCall,
    /// [`Event::is_video_call`]
    IsVideoCall,
    /// [`Event::status`]
    Status,
    /// [`Event::local_uid`]
    LocalUid,
    /// [`Event::recipients`]
    Recipients,
    /// [`Event::free_text`]
    FreeText,
    /// [`Event::subject`]
    Subject,
    /// [`Event::group_id`]
    GroupId,
    /// [`Event::message_token`]
    MessageToken,
    /// [`Event::event_count`]
    EventCount,
}

impl Property {
    /// Every property, in declaration order.
    pub const ALL: [Property; 17] = [
        Property::Id,
        Property::Type,
        Property::StartTime,
        Property::EndTime,
        Property::Direction,
        Property::IsDraft,
        Property::IsRead,
        Property::IsMissedCall,
        Property::IsVideoCall,
        Property::Status,
        Property::LocalUid,
        Property::Recipients,
        Property::FreeText,
        Property::Subject,
        Property::GroupId,
        Property::MessageToken,
        Property::EventCount,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Bit set of [`Property`] values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PropertySet(u32);

impl PropertySet {
    /// No properties.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every property.
    pub fn all() -> Self {
        Property::ALL.iter().copied().collect()
    }

    /// Membership test.
    pub fn contains(self, property: Property) -> bool {
        self.0 & property.bit() != 0
    }

    /// Add a property.
    pub fn insert(&mut self, property: Property) {
        self.0 |= property.bit();
    }

    /// Remove a property.
    pub fn remove(&mut self, property: Property) {
        self.0 &= !property.bit();
    }

    /// Set union.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether no property is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the contained properties.
    pub fn iter(self) -> impl Iterator<Item = Property> {
        Property::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

impl FromIterator<Property> for PropertySet {
    fn from_iter<T: IntoIterator<Item = Property>>(iter: T) -> Self {
        let mut set = Self::empty();
        for property in iter {
            set.insert(property);
        }
        set
    }
}

/// One message or call record.
#[derive(Clone, Debug)]
pub struct Event {
    id: i32,
    event_type: EventType,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    direction: Direction,
    is_draft: bool,
    is_read: bool,
    is_missed_call: bool,
    is_video_call: bool,
    status: EventStatus,
    local_uid: String,
    recipients: RecipientList,
    free_text: String,
    subject: String,
    group_id: i32,
    message_token: String,
    event_count: i32,
    modified: PropertySet,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            id: INVALID_ID,
            event_type: EventType::Unknown,
            start_time: DateTime::<Utc>::UNIX_EPOCH,
            end_time: DateTime::<Utc>::UNIX_EPOCH,
            direction: Direction::Unknown,
            is_draft: false,
            is_read: false,
            is_missed_call: false,
            is_video_call: false,
            status: EventStatus::Unknown,
            local_uid: String::new(),
            recipients: RecipientList::new(),
            free_text: String::new(),
            subject: String::new(),
            group_id: INVALID_ID,
            message_token: String::new(),
            event_count: 0,
            modified: PropertySet::empty(),
        }
    }
}

macro_rules! tracked_copy {
    ($(#[$meta:meta])* $field:ident, $setter:ident, $ty:ty, $prop:expr) => {
        $(#[$meta])*
        pub fn $field(&self) -> $ty {
            self.$field
        }

        #[doc = concat!("Set `", stringify!($field), "` and mark it modified.")]
        pub fn $setter(&mut self, value: $ty) {
            self.$field = value;
            self.modified.insert($prop);
        }
    };
}

macro_rules! tracked_string {
    ($(#[$meta:meta])* $field:ident, $setter:ident, $prop:expr) => {
        $(#[$meta])*
        pub fn $field(&self) -> &str {
            &self.$field
        }

        #[doc = concat!("Set `", stringify!($field), "` and mark it modified.")]
        pub fn $setter(&mut self, value: impl Into<String>) {
            self.$field = value.into();
            self.modified.insert($prop);
        }
    };
}

impl Event {
    /// New, unstored event of the given type.
    pub fn new(event_type: EventType) -> Self {
        let mut event = Self::default();
        event.set_event_type(event_type);
        event
    }

    tracked_copy!(
        /// Storage id, [`INVALID_ID`] until stored.
        id, set_id, i32, Property::Id
    );
    tracked_copy!(
        /// Event kind.
        event_type, set_event_type, EventType, Property::Type
    );
    tracked_copy!(
        /// Start time.
        start_time, set_start_time, DateTime<Utc>, Property::StartTime
    );
    tracked_copy!(
        /// End time.
        end_time, set_end_time, DateTime<Utc>, Property::EndTime
    );
    tracked_copy!(
        /// Direction.
        direction, set_direction, Direction, Property::Direction
    );
    tracked_copy!(
        /// Unsent draft.
        is_draft, set_is_draft, bool, Property::IsDraft
    );
    tracked_copy!(
        /// Read by the user.
        is_read, set_is_read, bool, Property::IsRead
    );
    tracked_copy!(
        /// Missed inbound call.
        is_missed_call, set_is_missed_call, bool, Property::IsMissedCall
    );
    tracked_copy!(
        /// Video call.
        is_video_call, set_is_video_call, bool, Property::IsVideoCall
    );
    tracked_copy!(
        /// Delivery status.
        status, set_status, EventStatus, Property::Status
    );
    tracked_copy!(
        /// Owning group, [`INVALID_ID`] when groupless.
        group_id, set_group_id, i32, Property::GroupId
    );
    tracked_copy!(
        /// Derived roll-up count; only meaningful on grouped call rows.
        event_count, set_event_count, i32, Property::EventCount
    );
    tracked_string!(
        /// Local account.
        local_uid, set_local_uid, Property::LocalUid
    );
    tracked_string!(
        /// Message body.
        free_text, set_free_text, Property::FreeText
    );
    tracked_string!(
        /// Subject line.
        subject, set_subject, Property::Subject
    );
    tracked_string!(
        /// Transport token, used for duplicate detection.
        message_token, set_message_token, Property::MessageToken
    );

    /// Remote recipients.
    pub fn recipients(&self) -> &RecipientList {
        &self.recipients
    }

    /// Replace the recipient list.
    pub fn set_recipients(&mut self, recipients: RecipientList) {
        self.recipients = recipients;
        self.modified.insert(Property::Recipients);
    }

    /// Mutable recipient access without marking the list modified.
    ///
    /// Used to swap in interned handles; the logical value does not change.
    pub fn recipients_mut(&mut self) -> &mut RecipientList {
        &mut self.recipients
    }

    /// Resolved contacts, derived from the recipients' shared state.
    pub fn contacts(&self) -> Vec<ContactInfo> {
        self.recipients.contacts()
    }

    /// Whether the event has been stored.
    pub fn is_valid(&self) -> bool {
        self.id >= 0
    }

    /// Shorthand for `event_type() == Call`.
    pub fn is_call(&self) -> bool {
        self.event_type == EventType::Call
    }

    /// Fields changed since creation or the last [`reset_modified`](Self::reset_modified).
    pub fn modified_properties(&self) -> PropertySet {
        self.modified
    }

    /// Clear the modified set.
    pub fn reset_modified(&mut self) {
        self.modified = PropertySet::empty();
    }

    /// Overwrite the modified set.
    pub fn set_modified_properties(&mut self, properties: PropertySet) {
        self.modified = properties;
    }

    /// Copy the fields in `other`'s modified set onto `self`.
    ///
    /// Does not touch `self`'s modified set.
    pub fn copy_valid_properties(&mut self, other: &Event) {
        for property in other.modified.iter() {
            match property {
                Property::Id => self.id = other.id,
                Property::Type => self.event_type = other.event_type,
                Property::StartTime => self.start_time = other.start_time,
                Property::EndTime => self.end_time = other.end_time,
                Property::Direction => self.direction = other.direction,
                Property::IsDraft => self.is_draft = other.is_draft,
                Property::IsRead => self.is_read = other.is_read,
                Property::IsMissedCall => self.is_missed_call = other.is_missed_call,
                Property::IsVideoCall => self.is_video_call = other.is_video_call,
                Property::Status => self.status = other.status,
                Property::LocalUid => self.local_uid.clone_from(&other.local_uid),
                Property::Recipients => self.recipients = other.recipients.clone(),
                Property::FreeText => self.free_text.clone_from(&other.free_text),
                Property::Subject => self.subject.clone_from(&other.subject),
                Property::GroupId => self.group_id = other.group_id,
                Property::MessageToken => self.message_token.clone_from(&other.message_token),
                Property::EventCount => self.event_count = other.event_count,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
