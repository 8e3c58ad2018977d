//! Recipients: `(local account, remote address)` pairs with shared
//! contact resolution state.
//!
//! A [`Recipient`] is a cheap, reference-counted handle. Two handles created
//! independently for the same address are *equal* (same [`RecipientKey`]) but
//! do not share resolution state; handles obtained by interning through the
//! contact cache registry are the *same instance*, so a resolution attached
//! once is visible to every event holding that handle.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::phone::minimize_phone_number;

/// Identity key of a recipient: local account plus the minimized (phone)
/// or exact (anything else) remote address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipientKey {
    local_uid: String,
    remote: String,
}

impl RecipientKey {
    /// Build the key for a `(local, remote)` pair.
    pub fn new(local_uid: &str, remote_uid: &str) -> Self {
        let remote = minimize_phone_number(remote_uid).unwrap_or_else(|| remote_uid.to_string());
        Self {
            local_uid: local_uid.to_string(),
            remote,
        }
    }

    /// Local account part.
    pub fn local_uid(&self) -> &str {
        &self.local_uid
    }

    /// Normalized remote part.
    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.local_uid, self.remote)
    }
}

/// A resolved contact identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    /// Contact id in the identity service.
    pub id: i32,
    /// Display name at the time of resolution.
    pub display_name: String,
}

impl ContactInfo {
    /// Convenience constructor.
    pub fn new(id: i32, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// Resolution state of a recipient.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ContactStatus {
    /// Never resolved, or demoted after an identity change.
    #[default]
    Unresolved,
    /// A resolution request is in flight.
    Pending,
    /// Resolved: `Some` contact, or `None` when no contact owns the address.
    Resolved(Option<ContactInfo>),
}

impl ContactStatus {
    /// Whether a resolution result (positive or negative) is attached.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// The resolved contact, if any.
    pub fn contact(&self) -> Option<&ContactInfo> {
        match self {
            Self::Resolved(Some(contact)) => Some(contact),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct RecipientData {
    local_uid: String,
    remote_uid: String,
    key: RecipientKey,
    status: RwLock<ContactStatus>,
}

/// Shared handle to a `(local, remote)` recipient.
#[derive(Clone)]
pub struct Recipient(Arc<RecipientData>);

impl Recipient {
    /// Create a standalone recipient (not interned).
    pub fn new(local_uid: impl Into<String>, remote_uid: impl Into<String>) -> Self {
        let local_uid = local_uid.into();
        let remote_uid = remote_uid.into();
        let key = RecipientKey::new(&local_uid, &remote_uid);
        Self(Arc::new(RecipientData {
            local_uid,
            remote_uid,
            key,
            status: RwLock::new(ContactStatus::Unresolved),
        }))
    }

    /// Local account.
    pub fn local_uid(&self) -> &str {
        &self.0.local_uid
    }

    /// Remote address as originally given.
    pub fn remote_uid(&self) -> &str {
        &self.0.remote_uid
    }

    /// Identity key.
    pub fn key(&self) -> &RecipientKey {
        &self.0.key
    }

    /// Phone-aware match: same local account and matching remote address.
    pub fn matches(&self, other: &Recipient) -> bool {
        self.0.key == other.0.key
    }

    /// Whether both handles point at the same shared instance.
    pub fn is_same_instance(&self, other: &Recipient) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Current resolution state.
    pub fn status(&self) -> ContactStatus {
        self.0.status.read().clone()
    }

    /// Resolved contact, if any.
    pub fn contact(&self) -> Option<ContactInfo> {
        self.0.status.read().contact().cloned()
    }

    /// Replace the resolution state. Returns `false` when nothing changed.
    pub fn set_status(&self, status: ContactStatus) -> bool {
        let mut current = self.0.status.write();
        if *current == status {
            return false;
        }
        *current = status;
        true
    }

    /// Non-owning handle for registries.
    pub fn downgrade(&self) -> WeakRecipient {
        WeakRecipient(Arc::downgrade(&self.0))
    }
}

impl PartialEq for Recipient {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl Eq for Recipient {}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipient")
            .field("local_uid", &self.0.local_uid)
            .field("remote_uid", &self.0.remote_uid)
            .field("status", &*self.0.status.read())
            .finish()
    }
}

/// Weak counterpart of [`Recipient`].
#[derive(Clone, Debug)]
pub struct WeakRecipient(Weak<RecipientData>);

impl WeakRecipient {
    /// Upgrade to a strong handle if any holder is still alive.
    pub fn upgrade(&self) -> Option<Recipient> {
        self.0.upgrade().map(Recipient)
    }

    /// Whether every strong handle has been dropped.
    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

/// Ordered, de-duplicated list of recipients.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecipientList(Vec<Recipient>);

impl RecipientList {
    /// Empty list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build from remote addresses on one local account.
    pub fn from_remotes<I, S>(local_uid: &str, remotes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::new();
        for remote in remotes {
            let _ = list.push(Recipient::new(local_uid, remote));
        }
        list
    }

    /// Append unless an equal recipient is already present.
    pub fn push(&mut self, recipient: Recipient) -> bool {
        if self.contains(&recipient) {
            return false;
        }
        self.0.push(recipient);
        true
    }

    /// Whether a matching recipient is present.
    pub fn contains(&self, recipient: &Recipient) -> bool {
        self.0.iter().any(|r| r.matches(recipient))
    }

    /// Same recipients, in any order.
    pub fn matches(&self, other: &RecipientList) -> bool {
        self.0.len() == other.0.len() && self.0.iter().all(|r| other.contains(r))
    }

    /// Iterate.
    pub fn iter(&self) -> std::slice::Iter<'_, Recipient> {
        self.0.iter()
    }

    /// Mutable access, used when interning.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Recipient> {
        self.0.iter_mut()
    }

    /// Number of recipients.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First recipient.
    pub fn first(&self) -> Option<&Recipient> {
        self.0.first()
    }

    /// Remote addresses in order.
    pub fn remote_uids(&self) -> Vec<String> {
        self.0.iter().map(|r| r.remote_uid().to_string()).collect()
    }

    /// Identity keys in order.
    pub fn keys(&self) -> Vec<RecipientKey> {
        self.0.iter().map(|r| r.key().clone()).collect()
    }

    /// Distinct resolved contacts.
    pub fn contacts(&self) -> Vec<ContactInfo> {
        let mut contacts: Vec<ContactInfo> = Vec::new();
        for contact in self.0.iter().filter_map(Recipient::contact) {
            if !contacts.iter().any(|c| c.id == contact.id) {
                contacts.push(contact);
            }
        }
        contacts
    }

    /// Whether every recipient has a resolution result.
    pub fn all_resolved(&self) -> bool {
        self.0.iter().all(|r| r.status().is_resolved())
    }
}

impl<'a> IntoIterator for &'a RecipientList {
    type Item = &'a Recipient;
    type IntoIter = std::slice::Iter<'a, Recipient>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Recipient> for RecipientList {
    fn from_iter<T: IntoIterator<Item = Recipient>>(iter: T) -> Self {
        let mut list = Self::new();
        for recipient in iter {
            let _ = list.push(recipient);
        }
        list
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
