//! Asynchronous contact resolution shared by every model in a process.
//!
//! Recipients are interned through a registry of weak handles, so all
//! events naming the same address share one resolution state. Lookups are
//! queued and resolved in batches by a background task; each batch ends
//! with a single [`ContactUpdate::Resolved`] broadcast listing every key
//! whose state changed. Registry entries nobody holds any more are swept
//! before each batch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use commlog_core::phone::remote_addresses_match;
use commlog_core::{ContactInfo, ContactStatus, Event, Recipient, RecipientKey, WeakRecipient};
use commlog_settings::ContactSettings;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::errors::{CacheError, ResolveError, Result};

/// A contact identity as announced by the identity service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Contact id.
    pub id: i32,
    /// Current display name.
    pub display_name: String,
    /// Remote addresses owned by the contact.
    pub addresses: Vec<String>,
}

impl Identity {
    /// Whether the identity owns the recipient's address.
    pub fn owns(&self, recipient: &Recipient) -> bool {
        self.addresses
            .iter()
            .any(|a| remote_addresses_match(a, recipient.remote_uid()))
    }

    fn info(&self) -> ContactInfo {
        ContactInfo::new(self.id, self.display_name.clone())
    }
}

/// Change pushed by the identity service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityChange {
    /// A contact was created or edited.
    Changed(Identity),
    /// A contact was deleted.
    Removed(i32),
}

/// The external identity service.
#[async_trait]
pub trait ContactResolver: Send + Sync {
    /// Look up the contact owning `key`; `Ok(None)` means no contact does.
    async fn resolve(&self, key: &RecipientKey) -> std::result::Result<Option<ContactInfo>, ResolveError>;

    /// Stream of identity changes.
    fn subscribe(&self) -> broadcast::Receiver<IdentityChange>;
}

/// Broadcast to models after resolution state changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContactUpdate {
    /// These keys have new resolution state.
    Resolved {
        /// Affected keys.
        keys: Vec<RecipientKey>,
    },
}

/// Answer to [`ContactCache::resolve`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Already resolved.
    Immediate(ContactStatus),
    /// Queued or in flight; a [`ContactUpdate`] will follow.
    Pending,
}

/// Process-wide contact cache.
pub struct ContactCache {
    registry: Mutex<HashMap<RecipientKey, WeakRecipient>>,
    pending: Mutex<HashSet<RecipientKey>>,
    queue: mpsc::UnboundedSender<RecipientKey>,
    updates: broadcast::Sender<ContactUpdate>,
    requests: AtomicUsize,
}

impl std::fmt::Debug for ContactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactCache")
            .field("registered", &self.registry.lock().len())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl ContactCache {
    /// Start the cache and its resolution task on the current runtime.
    pub fn start(
        resolver: Arc<dyn ContactResolver>,
        settings: &ContactSettings,
    ) -> Result<Arc<Self>> {
        let handle = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(256);
        let cache = Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            queue,
            updates,
            requests: AtomicUsize::new(0),
        });

        let identities = resolver.subscribe();
        drop(handle.spawn(run(
            Arc::downgrade(&cache),
            resolver,
            queue_rx,
            identities,
            settings.batch_size.max(1),
        )));
        Ok(cache)
    }

    /// Subscribe to resolution updates.
    pub fn subscribe(&self) -> broadcast::Receiver<ContactUpdate> {
        self.updates.subscribe()
    }

    /// Shared handle for `(local, remote)`.
    pub fn intern(&self, local_uid: &str, remote_uid: &str) -> Recipient {
        self.intern_recipient(&Recipient::new(local_uid, remote_uid))
    }

    /// Shared handle equal to `recipient`; registers it when new.
    pub fn intern_recipient(&self, recipient: &Recipient) -> Recipient {
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.get(recipient.key()).and_then(WeakRecipient::upgrade) {
            return existing;
        }
        let _ = registry.insert(recipient.key().clone(), recipient.downgrade());
        recipient.clone()
    }

    /// Swap every recipient of `event` for its shared handle.
    pub fn intern_event(&self, event: &mut Event) {
        for recipient in event.recipients_mut().iter_mut() {
            *recipient = self.intern_recipient(recipient);
        }
    }

    /// Current state of `recipient`, queueing a lookup when unresolved.
    ///
    /// A key that is already queued or in flight is not queued again.
    pub fn resolve(&self, recipient: &Recipient) -> Resolution {
        let shared = self.intern_recipient(recipient);
        match shared.status() {
            status @ ContactStatus::Resolved(_) => Resolution::Immediate(status),
            ContactStatus::Pending => Resolution::Pending,
            ContactStatus::Unresolved => {
                self.enqueue(&shared);
                Resolution::Pending
            }
        }
    }

    /// Queue every recipient of `event` that still needs a lookup.
    pub fn resolve_event(&self, event: &Event) {
        for recipient in event.recipients() {
            let _ = self.resolve(recipient);
        }
    }

    fn enqueue(&self, recipient: &Recipient) {
        if !self.pending.lock().insert(recipient.key().clone()) {
            return;
        }
        let _ = recipient.set_status(ContactStatus::Pending);
        if self.queue.send(recipient.key().clone()).is_err() {
            warn!(key = %recipient.key(), "contact resolution task is gone");
            let _ = self.pending.lock().remove(recipient.key());
            let _ = recipient.set_status(ContactStatus::Unresolved);
        }
    }

    fn lookup(&self, key: &RecipientKey) -> Option<Recipient> {
        self.registry.lock().get(key).and_then(WeakRecipient::upgrade)
    }

    fn live(&self) -> Vec<Recipient> {
        self.registry
            .lock()
            .values()
            .filter_map(WeakRecipient::upgrade)
            .collect()
    }

    /// Drop registry entries nobody holds any more. Returns how many.
    pub fn evict_unused(&self) -> usize {
        let mut registry = self.registry.lock();
        let before = registry.len();
        registry.retain(|_, weak| !weak.is_dead());
        before - registry.len()
    }

    /// Number of registry entries.
    pub fn registered(&self) -> usize {
        self.registry.lock().len()
    }

    /// Upstream lookups performed so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    fn announce(&self, keys: Vec<RecipientKey>) {
        if keys.is_empty() {
            return;
        }
        debug!(count = keys.len(), "contacts updated");
        let _ = self.updates.send(ContactUpdate::Resolved { keys });
    }

    async fn resolve_batch(
        &self,
        resolver: &dyn ContactResolver,
        first: RecipientKey,
        queue: &mut mpsc::UnboundedReceiver<RecipientKey>,
        batch_size: usize,
    ) {
        let mut keys = vec![first];
        while keys.len() < batch_size {
            match queue.try_recv() {
                Ok(key) => keys.push(key),
                Err(_) => break,
            }
        }

        let mut updated = Vec::new();
        for key in keys {
            let _ = self.requests.fetch_add(1, Ordering::Relaxed);
            let result = resolver.resolve(&key).await;
            let _ = self.pending.lock().remove(&key);
            let Some(recipient) = self.lookup(&key) else {
                continue;
            };
            match result {
                Ok(contact) => {
                    if recipient.set_status(ContactStatus::Resolved(contact)) {
                        updated.push(key);
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "contact lookup failed");
                    let _ = recipient.set_status(ContactStatus::Unresolved);
                }
            }
        }
        self.announce(updated);
    }

    /// Apply an identity change to every live recipient.
    pub fn apply_identity_change(&self, change: &IdentityChange) {
        let mut updated = Vec::new();
        for recipient in self.live() {
            let status = recipient.status();
            let changed = match change {
                IdentityChange::Changed(identity) => {
                    let owns = identity.owns(&recipient);
                    match status.contact() {
                        Some(current) if current.id == identity.id && !owns => {
                            self.demote(&recipient);
                            true
                        }
                        Some(current) if current.id == identity.id => {
                            recipient.set_status(ContactStatus::Resolved(Some(identity.info())))
                        }
                        None if owns && status != ContactStatus::Pending => {
                            recipient.set_status(ContactStatus::Resolved(Some(identity.info())))
                        }
                        _ => false,
                    }
                }
                IdentityChange::Removed(id) => {
                    if status.contact().is_some_and(|c| c.id == *id) {
                        self.demote(&recipient);
                        true
                    } else {
                        false
                    }
                }
            };
            if changed {
                updated.push(recipient.key().clone());
            }
        }
        self.announce(updated);
    }

    fn demote(&self, recipient: &Recipient) {
        let _ = recipient.set_status(ContactStatus::Unresolved);
        self.enqueue(recipient);
    }

    fn requeue_all(&self) {
        let mut updated = Vec::new();
        for recipient in self.live() {
            if recipient.status().is_resolved() {
                self.demote(&recipient);
                updated.push(recipient.key().clone());
            }
        }
        self.announce(updated);
    }
}

#[tracing::instrument(skip_all, name = "contact_cache")]
async fn run(
    cache: Weak<ContactCache>,
    resolver: Arc<dyn ContactResolver>,
    mut queue: mpsc::UnboundedReceiver<RecipientKey>,
    mut identities: broadcast::Receiver<IdentityChange>,
    batch_size: usize,
) {
    let mut identities_open = true;
    loop {
        tokio::select! {
            key = queue.recv() => {
                let Some(key) = key else { break };
                let Some(cache) = cache.upgrade() else { break };
                let evicted = cache.evict_unused();
                if evicted > 0 {
                    debug!(evicted, "dropped unused recipients");
                }
                cache.resolve_batch(resolver.as_ref(), key, &mut queue, batch_size).await;
            }
            change = identities.recv(), if identities_open => {
                let Some(cache) = cache.upgrade() else { break };
                match change {
                    Ok(change) => cache.apply_identity_change(&change),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "identity changes lagged, re-resolving everything");
                        cache.requeue_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("identity stream closed");
                        identities_open = false;
                    }
                }
            }
        }
    }
    debug!("contact resolution task exiting");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
