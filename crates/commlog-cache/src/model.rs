//! Consumer-facing event model.
//!
//! An [`EventModel`] owns one [`EventTree`] and keeps it in step with
//! storage. It is driven from a single owner: fetch results, contact
//! updates and bus messages queue up until the owner calls
//! [`EventModel::process_pending`] or awaits [`EventModel::next_update`].
//!
//! Local writes, remote bus messages and fetch merges all go through the
//! same `apply_*` helpers, so the tree changes the same way whatever the
//! source.

use std::collections::HashSet;
use std::sync::Arc;

use commlog_core::{Event, EventFilter, FilterPolicy, Group, Property, RecipientKey};
use commlog_settings::QuerySettings;
use commlog_store::{StorageGateway, StoreError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bridge::{BusEndpoint, BusMessage, Inbound, UpdateBus};
use crate::contacts::{ContactCache, ContactUpdate};
use crate::errors::{CacheError, Result};
use crate::grouping::{CallGrouping, SortPolicy, UpdateOutcome};
use crate::notify::{ModelNotification, Notifier};
use crate::pipeline::{Fetched, QueryMode, QueryPipeline, QueryWorker, Started};
use crate::tree::{EventTree, NodeId};

/// How rows are laid out.
#[derive(Clone, Debug, Default)]
pub enum Layout {
    /// One row per event, newest first.
    #[default]
    Flat,
    /// Calls rolled up into rows.
    Calls(CallGrouping),
}

enum Next {
    Fetched(Option<Fetched>),
    Contacts(std::result::Result<ContactUpdate, broadcast::error::RecvError>),
    Bus(Option<Inbound>),
}

/// A view over stored events.
pub struct EventModel {
    gateway: Arc<dyn StorageGateway>,
    tree: EventTree,
    notifier: Notifier,
    pipeline: QueryPipeline,
    policy: FilterPolicy,
    layout: Layout,
    contacts: Option<Arc<ContactCache>>,
    contact_rx: Option<broadcast::Receiver<ContactUpdate>>,
    bus: Option<BusEndpoint>,
    stale: bool,
    refetch_requested: bool,
}

impl std::fmt::Debug for EventModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventModel")
            .field("policy", &self.policy)
            .field("layout", &self.layout)
            .field("mode", &self.pipeline.mode())
            .field("rows", &self.tree.row_count(self.tree.root()))
            .finish_non_exhaustive()
    }
}

impl EventModel {
    /// Flat model over every event, fetching asynchronously.
    pub fn new(gateway: Arc<dyn StorageGateway>) -> Self {
        let notifier = Notifier::default();
        Self {
            tree: EventTree::new(notifier.clone()),
            notifier,
            pipeline: QueryPipeline::new(Arc::clone(&gateway), QueryMode::default()),
            gateway,
            policy: FilterPolicy::All,
            layout: Layout::Flat,
            contacts: None,
            contact_rx: None,
            bus: None,
            stale: false,
            refetch_requested: false,
        }
    }

    /// Model configured from query settings; starts a dedicated worker
    /// thread when the settings ask for one.
    pub fn from_settings(gateway: Arc<dyn StorageGateway>, settings: &QuerySettings) -> Result<Self> {
        let mut model = Self::new(gateway);
        model.pipeline.set_mode(QueryMode::from(settings));
        if settings.dedicated_worker {
            model.set_worker(Some(Arc::new(QueryWorker::spawn("commlog-query")?)));
        }
        Ok(model)
    }

    /// Resolve recipients through `contacts`.
    #[must_use]
    pub fn with_contacts(mut self, contacts: Arc<ContactCache>) -> Self {
        self.contact_rx = Some(contacts.subscribe());
        self.contacts = Some(contacts);
        self
    }

    /// Publish writes to, and replay changes from, `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: &UpdateBus) -> Self {
        self.bus = Some(bus.endpoint());
        self
    }

    /// Builder form of [`set_filter_policy`](Self::set_filter_policy).
    #[must_use]
    pub fn with_filter_policy(mut self, policy: FilterPolicy) -> Self {
        self.set_filter_policy(policy);
        self
    }

    /// Builder form of [`set_layout`](Self::set_layout).
    #[must_use]
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.set_layout(layout);
        self
    }

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────

    /// Change which events the model shows; applies on the next fetch.
    pub fn set_filter_policy(&mut self, policy: FilterPolicy) {
        self.policy = policy;
        self.stale = true;
    }

    /// Active filter policy.
    pub fn filter_policy(&self) -> &FilterPolicy {
        &self.policy
    }

    /// Change the fetch mode; outstanding results are dropped.
    pub fn set_query_mode(&mut self, mode: QueryMode) {
        self.pipeline.set_mode(mode);
    }

    /// Active fetch mode.
    pub fn query_mode(&self) -> QueryMode {
        self.pipeline.mode()
    }

    /// Change the row layout; applies on the next fetch.
    pub fn set_layout(&mut self, layout: Layout) {
        self.layout = layout;
        self.stale = true;
    }

    /// Group calls under `policy`; applies on the next fetch.
    pub fn set_sort_policy(&mut self, policy: SortPolicy) {
        self.set_layout(Layout::Calls(CallGrouping::new(policy)));
    }

    /// Active grouping policy, if calls are grouped.
    pub fn sort_policy(&self) -> Option<SortPolicy> {
        match &self.layout {
            Layout::Flat => None,
            Layout::Calls(grouping) => Some(grouping.policy()),
        }
    }

    /// Run storage reads on `worker` instead of blocking tasks.
    pub fn set_worker(&mut self, worker: Option<Arc<QueryWorker>>) {
        self.pipeline.set_worker(worker);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelNotification> {
        self.notifier.subscribe()
    }

    /// The underlying tree.
    pub fn tree(&self) -> &EventTree {
        &self.tree
    }

    /// Rows under `parent`; `None` means the top level.
    pub fn row_count(&self, parent: Option<NodeId>) -> usize {
        self.tree.row_count(parent.unwrap_or(NodeId::ROOT))
    }

    /// Node at `row` under `parent`.
    pub fn node_at(&self, parent: Option<NodeId>, row: usize) -> Option<NodeId> {
        self.tree.child_at(parent.unwrap_or(NodeId::ROOT), row)
    }

    /// Event at `row` under `parent`.
    pub fn event_at(&self, parent: Option<NodeId>, row: usize) -> Option<&Event> {
        self.node_at(parent, row).and_then(|n| self.tree.event(n))
    }

    /// Cached event with storage id `event_id`.
    pub fn event_by_id(&self, event_id: i32) -> Option<&Event> {
        self.tree
            .find_by_id(event_id)
            .and_then(|n| self.tree.event(n))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fetching
    // ─────────────────────────────────────────────────────────────────────

    /// Fetch the events the policy accepts and merge them into the view.
    ///
    /// Rows already present are kept; in sync mode the merge is done on
    /// return, otherwise it happens when the result is pumped.
    pub fn fetch(&mut self) -> Result<()> {
        if std::mem::take(&mut self.stale) {
            self.reset_view();
        }
        let filter = self.policy.to_filter();
        debug!(policy = ?self.policy, mode = ?self.pipeline.mode(), "fetch requested");
        match self.pipeline.start(filter)? {
            Started::Done(rows) => self.apply_fetched(Fetched { first: true, rows }),
            Started::Dispatched => {}
        }
        Ok(())
    }

    /// Drop the view and fetch it again.
    pub fn refetch(&mut self) -> Result<()> {
        self.refetch_requested = false;
        self.stale = true;
        self.fetch()
    }

    /// Whether a streamed fetch has more chunks to request.
    pub fn can_fetch_more(&self) -> bool {
        self.pipeline.can_fetch_more()
    }

    /// Request the next chunk of a streamed fetch.
    pub fn fetch_more(&mut self) -> Result<bool> {
        self.pipeline.fetch_more()
    }

    fn reset_view(&mut self) {
        self.tree.clear();
        if let Layout::Calls(grouping) = &mut self.layout {
            grouping.reset();
        }
    }

    fn apply_fetched(&mut self, fetched: Fetched) {
        let success = match fetched.rows {
            Ok(rows) => match self.merge(rows) {
                Ok(merged) => {
                    debug!(merged, first = fetched.first, "fetch merged");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "failed to merge fetched rows");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "fetch failed");
                false
            }
        };
        if fetched.first || !success {
            self.notifier.emit(ModelNotification::Ready { success });
        }
    }

    /// Merge newest-first rows, skipping ids already cached.
    fn merge(&mut self, rows: Vec<Event>) -> Result<usize> {
        let mut seen = self.tree.event_ids();
        let mut fresh: Vec<Event> = rows.into_iter().filter(|e| seen.insert(e.id())).collect();
        for event in &mut fresh {
            self.attach_contacts(event);
        }
        let merged = fresh.len();

        match &mut self.layout {
            Layout::Flat => {
                let root = self.tree.root();
                let Some(first) = fresh.first() else {
                    return Ok(0);
                };
                let at = self.tree.newest_first_position(root, first);
                if at == self.tree.row_count(root) {
                    let _ = self.tree.insert_many(root, at, fresh)?;
                } else {
                    for event in fresh {
                        let at = self.tree.newest_first_position(root, &event);
                        let _ = self.tree.insert(root, at, event)?;
                    }
                }
            }
            Layout::Calls(grouping) => grouping.fill(&mut self.tree, fresh)?,
        }
        Ok(merged)
    }

    fn attach_contacts(&self, event: &mut Event) {
        if let Some(contacts) = &self.contacts {
            contacts.intern_event(event);
            contacts.resolve_event(event);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local writes
    // ─────────────────────────────────────────────────────────────────────

    /// Store one event and show it if the policy accepts it.
    pub fn add_event(&mut self, event: &mut Event) -> Result<()> {
        self.add_events(std::slice::from_mut(event))
    }

    /// Store a batch in one transaction.
    ///
    /// On failure nothing is stored and subscribers receive
    /// [`ModelNotification::CommitFailed`] with the attempted batch.
    pub fn add_events(&mut self, events: &mut [Event]) -> Result<()> {
        if let Err(e) = self.gateway.add_events(events) {
            if let StoreError::DuplicateEvent { existing_id } = &e {
                warn!(existing_id, count = events.len(), "bulk add rejected");
            }
            self.notifier.emit(ModelNotification::CommitFailed {
                events: events.to_vec(),
            });
            return Err(e.into());
        }
        for event in events.iter() {
            self.apply_added(event.clone())?;
        }
        self.publish(BusMessage::EventsAdded(events.to_vec()));
        Ok(())
    }

    /// Write one event's modified properties.
    pub fn modify_event(&mut self, event: &Event) -> Result<()> {
        self.modify_events(std::slice::from_ref(event))
    }

    /// Write the modified properties of a batch.
    pub fn modify_events(&mut self, events: &[Event]) -> Result<()> {
        self.gateway.modify_events(events)?;
        for event in events {
            self.apply_updated(event)?;
        }
        self.publish(BusMessage::EventsUpdated(events.to_vec()));
        self.refetch_if_requested()
    }

    /// Delete the event, or under call grouping every event of its row.
    ///
    /// Deleting a single event inside a grouped row, or deleting under a
    /// legacy sort policy, is [`CacheError::Unsupported`].
    pub fn delete_event(&mut self, event_id: i32) -> Result<()> {
        let (row, ids) = match &self.layout {
            Layout::Flat => (self.tree.find_by_id(event_id), vec![event_id]),
            Layout::Calls(grouping) => match grouping.row_event_ids(&self.tree, event_id)? {
                Some((row, ids)) => (Some(row), ids),
                None => (None, vec![event_id]),
            },
        };
        self.gateway.delete_events(&ids)?;

        if let Some(row) = row {
            match &mut self.layout {
                Layout::Flat => {
                    let _ = self.tree.remove(row)?;
                }
                Layout::Calls(grouping) => grouping.remove_row(&mut self.tree, row)?,
            }
        }
        for id in ids {
            self.publish(BusMessage::EventDeleted(id));
        }
        Ok(())
    }

    /// Mark every unread event the policy accepts as read, loaded or not.
    /// Returns how many changed.
    pub fn mark_all_read(&mut self) -> Result<usize> {
        let filter = EventFilter {
            is_read: Some(false),
            ..self.policy.to_filter()
        };
        let ids: Vec<i32> = self
            .gateway
            .query_events(&filter)?
            .iter()
            .map(Event::id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.gateway.mark_read(&ids, true)?;
        self.apply_read(&ids, true)?;
        self.publish(BusMessage::EventsUpdated(read_patches(&ids, true)));
        Ok(ids.len())
    }

    /// Store a conversation group.
    pub fn add_group(&mut self, group: &mut Group) -> Result<()> {
        self.gateway.add_group(group)?;
        self.publish(BusMessage::GroupsAdded(vec![group.clone()]));
        Ok(())
    }

    /// Overwrite a stored conversation group.
    pub fn modify_group(&mut self, group: &Group) -> Result<()> {
        self.gateway.modify_group(group)?;
        self.publish(BusMessage::GroupsUpdated(vec![group.clone()]));
        Ok(())
    }

    /// Delete groups and every event in them.
    pub fn delete_groups(&mut self, ids: &[i32]) -> Result<()> {
        self.gateway.delete_groups(ids)?;
        self.apply_groups_deleted(ids)?;
        self.publish(BusMessage::GroupsDeleted(ids.to_vec()));
        Ok(())
    }

    fn publish(&self, message: BusMessage) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish(message);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Applying changes
    // ─────────────────────────────────────────────────────────────────────

    fn apply_added(&mut self, mut event: Event) -> Result<()> {
        if !self.policy.accepts(&event) || self.tree.find_by_id(event.id()).is_some() {
            return Ok(());
        }
        event.reset_modified();
        self.attach_contacts(&mut event);
        match &mut self.layout {
            Layout::Flat => {
                let root = self.tree.root();
                let at = self.tree.newest_first_position(root, &event);
                let _ = self.tree.insert(root, at, event)?;
            }
            Layout::Calls(grouping) => {
                let _ = grouping.insert(&mut self.tree, event)?;
            }
        }
        Ok(())
    }

    /// Apply a change to an event. Events the view has not loaded are left
    /// alone; a later fetch picks up their current state.
    fn apply_updated(&mut self, event: &Event) -> Result<()> {
        let mut patch = event.clone();
        let mut modified = patch.modified_properties();
        modified.remove(Property::Id);
        modified.remove(Property::EventCount);
        patch.set_modified_properties(modified);

        let grouping = match &mut self.layout {
            Layout::Flat => {
                let Some(node) = self.tree.find_by_id(event.id()) else {
                    return Ok(());
                };
                self.tree.update(node, &patch)?;
                let accepted = self.tree.event(node).is_some_and(|e| self.policy.accepts(e));
                if !accepted {
                    let _ = self.tree.remove(node)?;
                } else if modified.contains(Property::StartTime) {
                    let moved = self.tree.remove(node)?;
                    let root = self.tree.root();
                    let at = self.tree.newest_first_position(root, &moved);
                    let _ = self.tree.insert(root, at, moved)?;
                }
                return Ok(());
            }
            Layout::Calls(grouping) => grouping,
        };

        let (read_propagated, regroup) = match grouping.update(&mut self.tree, &patch)? {
            UpdateOutcome::NotFound => return Ok(()),
            UpdateOutcome::Applied {
                read_propagated,
                regroup,
            } => (read_propagated, regroup),
        };
        let by_time = grouping.policy() == SortPolicy::ByTime;

        if !read_propagated.is_empty() {
            let read = event.is_read();
            self.gateway.mark_read(&read_propagated, read)?;
            self.publish(BusMessage::EventsUpdated(read_patches(&read_propagated, read)));
        }

        let rejected = self
            .tree
            .find_by_id(event.id())
            .and_then(|n| self.tree.event(n))
            .is_some_and(|e| !self.policy.accepts(e));
        let moved = modified.contains(Property::StartTime);
        if moved && by_time {
            // A call moved in time can join any run in the view.
            self.refetch_requested = true;
        } else if regroup || rejected || moved {
            self.regroup(event.id())?;
        }
        Ok(())
    }

    /// Re-read the rows affected by a change to `event_id` and rebuild just
    /// those rows.
    fn regroup(&mut self, event_id: i32) -> Result<()> {
        let Layout::Calls(grouping) = &self.layout else {
            return Ok(());
        };
        let rows = grouping.dirty_rows(&self.tree, event_id);
        let ids: Vec<i32> = rows
            .iter()
            .flat_map(|row| self.tree.children(*row).iter())
            .filter_map(|c| self.tree.event(*c).map(Event::id))
            .collect();

        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut stored) = self.gateway.get_event(id)? else {
                continue;
            };
            if self.policy.accepts(&stored) {
                self.attach_contacts(&mut stored);
                events.push(stored);
            }
        }
        debug!(event_id, rows = rows.len(), events = events.len(), "regrouping");

        if let Layout::Calls(grouping) = &mut self.layout {
            grouping.rebuild(&mut self.tree, &rows, events)?;
        }
        Ok(())
    }

    fn apply_deleted(&mut self, event_id: i32) -> Result<()> {
        match &mut self.layout {
            Layout::Flat => {
                if let Some(node) = self.tree.find_by_id(event_id) {
                    let _ = self.tree.remove(node)?;
                }
            }
            Layout::Calls(grouping) => match grouping.remove_event(&mut self.tree, event_id) {
                Ok(_) => {}
                Err(CacheError::Unsupported(reason)) => {
                    debug!(event_id, %reason, "remote delete needs a refetch");
                    self.refetch_requested = true;
                }
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }

    fn apply_read(&mut self, ids: &[i32], read: bool) -> Result<()> {
        let ids: HashSet<i32> = ids.iter().copied().collect();
        let mut patch = Event::default();
        patch.set_is_read(read);
        for node in self.tree.nodes() {
            let hit = self
                .tree
                .event(node)
                .is_some_and(|e| ids.contains(&e.id()) && e.is_read() != read);
            if hit {
                self.tree.update(node, &patch)?;
            }
        }
        Ok(())
    }

    fn apply_groups_deleted(&mut self, group_ids: &[i32]) -> Result<()> {
        let root = self.tree.root();
        let doomed: Vec<NodeId> = self
            .tree
            .children(root)
            .iter()
            .copied()
            .filter(|n| {
                self.tree
                    .event(*n)
                    .is_some_and(|e| group_ids.contains(&e.group_id()))
            })
            .collect();
        for node in doomed {
            match &mut self.layout {
                Layout::Flat => {
                    let _ = self.tree.remove(node)?;
                }
                Layout::Calls(grouping) => grouping.remove_row(&mut self.tree, node)?,
            }
        }
        Ok(())
    }

    fn apply_contact_update(&self, keys: &[RecipientKey]) {
        let keys: HashSet<&RecipientKey> = keys.iter().collect();
        for node in self.tree.nodes() {
            let hit = self
                .tree
                .event(node)
                .is_some_and(|e| e.recipients().iter().any(|r| keys.contains(r.key())));
            if hit {
                self.tree.touch(node);
            }
        }
    }

    fn touch_all(&self) {
        for node in self.tree.nodes() {
            self.tree.touch(node);
        }
    }

    fn apply_inbound(&mut self, inbound: Inbound) -> Result<()> {
        let message = match inbound {
            Inbound::Message(message) => message,
            Inbound::Lagged(missed) => {
                warn!(missed, "missed bus messages, refetching");
                self.refetch_requested = true;
                return Ok(());
            }
        };
        debug!(kind = message.kind(), "applying remote change");
        match message {
            BusMessage::EventsAdded(events) => {
                for event in events {
                    self.apply_added(event)?;
                }
            }
            BusMessage::EventsUpdated(events) => {
                for event in &events {
                    self.apply_updated(event)?;
                }
            }
            BusMessage::EventDeleted(id) => self.apply_deleted(id)?,
            BusMessage::GroupsDeleted(ids) => self.apply_groups_deleted(&ids)?,
            BusMessage::GroupsAdded(_) | BusMessage::GroupsUpdated(_) => {}
        }
        Ok(())
    }

    fn refetch_if_requested(&mut self) -> Result<()> {
        if self.refetch_requested {
            self.refetch()?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pumping
    // ─────────────────────────────────────────────────────────────────────

    /// Apply everything already queued without waiting. Returns the number
    /// of items applied.
    pub fn process_pending(&mut self) -> Result<usize> {
        let mut applied = 0;
        while let Some(fetched) = self.pipeline.try_next() {
            self.apply_fetched(fetched);
            applied += 1;
        }

        loop {
            let Some(rx) = self.contact_rx.as_mut() else {
                break;
            };
            match rx.try_recv() {
                Ok(ContactUpdate::Resolved { keys }) => self.apply_contact_update(&keys),
                Err(broadcast::error::TryRecvError::Lagged(_)) => self.touch_all(),
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.contact_rx = None;
                    break;
                }
                Err(broadcast::error::TryRecvError::Empty) => break,
            }
            applied += 1;
        }

        loop {
            let Some(bus) = self.bus.as_mut() else {
                break;
            };
            let Some(inbound) = bus.try_recv() else {
                break;
            };
            self.apply_inbound(inbound)?;
            applied += 1;
        }

        self.refetch_if_requested()?;
        Ok(applied)
    }

    /// Wait for the next fetch result, contact update or bus message and
    /// apply it.
    ///
    /// Returns `false` without waiting when nothing can arrive: no fetch is
    /// in flight and neither contacts nor a bus are attached.
    pub async fn next_update(&mut self) -> Result<bool> {
        let fetching = self.pipeline.is_in_flight();
        if !fetching && self.contact_rx.is_none() && self.bus.is_none() {
            return Ok(false);
        }

        let next = {
            let pipeline = &mut self.pipeline;
            let contacts = self.contact_rx.as_mut();
            let bus = self.bus.as_mut();
            tokio::select! {
                fetched = pipeline.next(), if fetching => Next::Fetched(fetched),
                update = recv_contacts(contacts) => Next::Contacts(update),
                inbound = recv_bus(bus) => Next::Bus(inbound),
            }
        };

        match next {
            Next::Fetched(Some(fetched)) => self.apply_fetched(fetched),
            Next::Fetched(None) => return Err(CacheError::WorkerGone),
            Next::Contacts(Ok(ContactUpdate::Resolved { keys })) => self.apply_contact_update(&keys),
            Next::Contacts(Err(broadcast::error::RecvError::Lagged(_))) => self.touch_all(),
            Next::Contacts(Err(broadcast::error::RecvError::Closed)) => self.contact_rx = None,
            Next::Bus(Some(inbound)) => self.apply_inbound(inbound)?,
            Next::Bus(None) => self.bus = None,
        }
        self.refetch_if_requested()?;
        Ok(true)
    }
}

fn read_patches(ids: &[i32], read: bool) -> Vec<Event> {
    ids.iter()
        .map(|&id| {
            let mut patch = Event::default();
            patch.set_id(id);
            patch.set_is_read(read);
            patch
        })
        .collect()
}

async fn recv_contacts(
    rx: Option<&mut broadcast::Receiver<ContactUpdate>>,
) -> std::result::Result<ContactUpdate, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_bus(bus: Option<&mut BusEndpoint>) -> Option<Inbound> {
    match bus {
        Some(bus) => bus.recv().await,
        None => std::future::pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{DateTime, TimeZone, Utc};
    use commlog_core::{CallType, Direction, EventType, RecipientList};
    use commlog_store::SqliteGateway;

    const ACCOUNT: &str = "ring/tel/account0";

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    fn call(remote: &str, minute: u32, missed: bool) -> Event {
        let mut event = Event::new(EventType::Call);
        event.set_local_uid(ACCOUNT);
        event.set_recipients(RecipientList::from_remotes(ACCOUNT, [remote]));
        event.set_direction(Direction::Inbound);
        event.set_is_missed_call(missed);
        event.set_start_time(at(minute));
        event.set_end_time(at(minute));
        event
    }

    fn sms(remote: &str, minute: u32, text: &str) -> Event {
        let mut event = Event::new(EventType::Sms);
        event.set_local_uid(ACCOUNT);
        event.set_recipients(RecipientList::from_remotes(ACCOUNT, [remote]));
        event.set_direction(Direction::Inbound);
        event.set_free_text(text);
        event.set_start_time(at(minute));
        event
    }

    fn sync_model() -> EventModel {
        let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::in_memory().unwrap());
        let mut model = EventModel::new(gateway);
        model.set_query_mode(QueryMode::Sync);
        model
    }

    fn top_ids(model: &EventModel) -> Vec<i32> {
        (0..model.row_count(None))
            .filter_map(|row| model.event_at(None, row).map(Event::id))
            .collect()
    }

    #[test]
    fn flat_add_keeps_newest_first() {
        let mut model = sync_model();
        let mut old = sms("5550100", 1, "old");
        let mut new = sms("5550100", 5, "new");
        let mut mid = sms("5550100", 3, "mid");
        model.add_event(&mut old).unwrap();
        model.add_event(&mut new).unwrap();
        model.add_event(&mut mid).unwrap();
        assert_eq!(top_ids(&model), vec![new.id(), mid.id(), old.id()]);
    }

    #[test]
    fn sync_fetch_merges_idempotently() {
        let mut model = sync_model();
        let mut events = vec![sms("5550100", 1, "a"), sms("5550100", 2, "b")];
        model.gateway.add_events(&mut events).unwrap();

        let mut rx = model.subscribe();
        model.fetch().unwrap();
        assert_eq!(model.row_count(None), 2);
        model.fetch().unwrap();
        assert_eq!(model.row_count(None), 2);

        let mut ready = 0;
        while let Ok(n) = rx.try_recv() {
            if matches!(n, ModelNotification::Ready { success: true }) {
                ready += 1;
            }
        }
        assert_eq!(ready, 2);
    }

    #[test]
    fn policy_change_applies_on_next_fetch() {
        let mut model = sync_model();
        let mut events = vec![sms("5550100", 1, "a"), call("5550100", 2, false)];
        model.gateway.add_events(&mut events).unwrap();
        model.fetch().unwrap();
        assert_eq!(model.row_count(None), 2);

        model.set_filter_policy(FilterPolicy::all_calls());
        assert_eq!(model.row_count(None), 2);
        model.fetch().unwrap();
        assert_eq!(top_ids(&model), vec![events[1].id()]);
    }

    #[test]
    fn add_rejected_by_policy_is_stored_but_hidden() {
        let mut model = sync_model().with_filter_policy(FilterPolicy::all_calls());
        let mut text = sms("5550100", 1, "hi");
        model.add_event(&mut text).unwrap();
        assert!(text.is_valid());
        assert_eq!(model.row_count(None), 0);
    }

    #[test]
    fn duplicate_batch_emits_commit_failed() {
        let mut model = sync_model();
        let mut first = sms("5550100", 1, "same");
        model.add_event(&mut first).unwrap();

        let mut rx = model.subscribe();
        let mut batch = vec![sms("5550199", 2, "fresh"), sms("5550100", 1, "same")];
        let err = model.add_events(&mut batch).unwrap_err();
        assert_matches!(err, CacheError::Store(StoreError::DuplicateEvent { .. }));
        assert_matches!(
            rx.try_recv(),
            Ok(ModelNotification::CommitFailed { events }) if events.len() == 2
        );
        assert!(batch.iter().all(|e| !e.is_valid()));
        assert_eq!(model.row_count(None), 1);
    }

    #[test]
    fn flat_modify_drops_rejected_event() {
        let mut model = sync_model().with_filter_policy(FilterPolicy::Unread);
        let mut event = sms("5550100", 1, "a");
        model.add_event(&mut event).unwrap();
        assert_eq!(model.row_count(None), 1);

        event.set_is_read(true);
        model.modify_event(&event).unwrap();
        assert_eq!(model.row_count(None), 0);
    }

    #[test]
    fn flat_modify_repositions_on_time_change() {
        let mut model = sync_model();
        let mut a = sms("5550100", 1, "a");
        let mut b = sms("5550100", 2, "b");
        model.add_event(&mut a).unwrap();
        model.add_event(&mut b).unwrap();
        assert_eq!(top_ids(&model), vec![b.id(), a.id()]);

        a.set_start_time(at(9));
        model.modify_event(&a).unwrap();
        assert_eq!(top_ids(&model), vec![a.id(), b.id()]);
    }

    #[test]
    fn grouped_read_propagates_to_storage() {
        let mut model = sync_model();
        model.set_sort_policy(SortPolicy::ByContact);
        let mut calls = vec![call("5550100", 1, true), call("5550100", 2, true)];
        model.gateway.add_events(&mut calls).unwrap();
        model.fetch().unwrap();
        assert_eq!(model.row_count(None), 1);

        let mut newest = calls[1].clone();
        newest.set_is_read(true);
        model.modify_event(&newest).unwrap();

        let other = model.gateway.get_event(calls[0].id()).unwrap().unwrap();
        assert!(other.is_read());
        let row = model.node_at(None, 0).unwrap();
        assert!(model.tree().children(row).iter().all(|c| model.tree().event(*c).unwrap().is_read()));
    }

    #[test]
    fn grouped_video_change_rebuilds_only_its_row() {
        let mut model = sync_model();
        model.set_sort_policy(SortPolicy::ByContact);
        let mut calls = vec![
            call("5550100", 1, false),
            call("5550100", 2, false),
            call("5550199", 3, false),
        ];
        model.gateway.add_events(&mut calls).unwrap();
        model.fetch().unwrap();
        assert_eq!(top_ids(&model), vec![calls[2].id(), calls[1].id()]);
        let untouched = model.node_at(None, 0).unwrap();

        let mut rx = model.subscribe();
        let mut upgraded = calls[0].clone();
        upgraded.set_is_video_call(true);
        model.modify_event(&upgraded).unwrap();

        assert_eq!(top_ids(&model), vec![calls[2].id(), calls[1].id(), calls[0].id()]);
        assert_eq!(model.node_at(None, 0), Some(untouched));
        assert!(model.event_at(None, 2).unwrap().is_video_call());
        while let Ok(n) = rx.try_recv() {
            assert!(!matches!(n, ModelNotification::ModelReset), "view was reset");
        }
    }

    #[test]
    fn by_time_missed_edit_splits_row() {
        let mut model = sync_model();
        model.set_sort_policy(SortPolicy::ByTime);
        let mut calls = vec![call("5550100", 1, true), call("5550100", 2, true)];
        model.gateway.add_events(&mut calls).unwrap();
        model.fetch().unwrap();
        assert_eq!(model.row_count(None), 1);
        assert_eq!(model.event_at(None, 0).unwrap().event_count(), 2);

        let mut answered = calls[0].clone();
        answered.set_is_missed_call(false);
        model.modify_event(&answered).unwrap();

        assert_eq!(top_ids(&model), vec![calls[1].id(), calls[0].id()]);
        for row in 0..2 {
            let node = model.node_at(None, row).unwrap();
            assert_eq!(model.row_count(Some(node)), 1);
            assert_eq!(model.event_at(None, row).unwrap().event_count(), 1);
        }
        assert!(!model.event_at(None, 1).unwrap().is_missed_call());
    }

    #[test]
    fn grouped_policy_rejection_drops_event_from_row() {
        let mut model = sync_model().with_filter_policy(FilterPolicy::Calls {
            call_type: CallType::Missed,
            local_uid: None,
            after: None,
        });
        model.set_sort_policy(SortPolicy::ByContact);
        let mut calls = vec![call("5550100", 1, true), call("5550100", 2, true)];
        model.gateway.add_events(&mut calls).unwrap();
        model.fetch().unwrap();
        let row = model.node_at(None, 0).unwrap();
        assert_eq!(model.row_count(Some(row)), 2);

        let mut answered = calls[0].clone();
        answered.set_is_missed_call(false);
        model.modify_event(&answered).unwrap();

        assert_eq!(top_ids(&model), vec![calls[1].id()]);
        let row = model.node_at(None, 0).unwrap();
        assert_eq!(model.row_count(Some(row)), 1);
        assert!(model.event_by_id(calls[0].id()).is_none());
    }

    #[test]
    fn update_to_unloaded_event_is_ignored() {
        let mut model = sync_model();
        let mut loaded = vec![sms("5550100", 1, "a")];
        model.gateway.add_events(&mut loaded).unwrap();
        model.fetch().unwrap();

        let mut elsewhere = vec![sms("5550199", 2, "b")];
        model.gateway.add_events(&mut elsewhere).unwrap();
        let mut read = elsewhere[0].clone();
        read.set_is_read(true);
        model.modify_event(&read).unwrap();

        assert_eq!(top_ids(&model), vec![loaded[0].id()]);
        assert!(model.gateway.get_event(elsewhere[0].id()).unwrap().unwrap().is_read());
    }

    #[test]
    fn grouped_delete_removes_whole_row() {
        let mut model = sync_model();
        model.set_sort_policy(SortPolicy::ByContact);
        let mut calls = vec![
            call("5550100", 1, false),
            call("5550100", 2, false),
            call("5550199", 3, false),
        ];
        model.gateway.add_events(&mut calls).unwrap();
        model.fetch().unwrap();
        assert_eq!(model.row_count(None), 2);

        assert_matches!(model.delete_event(calls[0].id()), Err(CacheError::Unsupported(_)));
        model.delete_event(calls[1].id()).unwrap();
        assert_eq!(model.row_count(None), 1);
        assert!(model.gateway.get_event(calls[0].id()).unwrap().is_none());
        assert!(model.gateway.get_event(calls[2].id()).unwrap().is_some());
    }

    #[test]
    fn legacy_policy_delete_fails_fast() {
        let mut model = sync_model();
        model.set_sort_policy(SortPolicy::ByType);
        let mut one = call("5550100", 1, false);
        model.add_event(&mut one).unwrap();
        assert_matches!(model.delete_event(one.id()), Err(CacheError::Unsupported(_)));
        assert!(model.gateway.get_event(one.id()).unwrap().is_some());
    }

    #[test]
    fn mark_all_read_covers_unloaded_rows() {
        let mut model = sync_model();
        let mut events = vec![sms("5550100", 1, "a"), sms("5550100", 2, "b")];
        model.gateway.add_events(&mut events).unwrap();
        model.fetch().unwrap();

        let mut late = vec![sms("5550100", 3, "c")];
        model.gateway.add_events(&mut late).unwrap();

        assert_eq!(model.mark_all_read().unwrap(), 3);
        assert!(model.event_by_id(events[0].id()).unwrap().is_read());
        assert!(model.gateway.get_event(late[0].id()).unwrap().unwrap().is_read());
        assert_eq!(model.mark_all_read().unwrap(), 0);
    }

    #[test]
    fn deleting_group_drops_its_rows() {
        let mut model = sync_model();
        let mut group = Group::new(ACCOUNT, RecipientList::from_remotes(ACCOUNT, ["5550100"]));
        model.add_group(&mut group).unwrap();

        let mut grouped = sms("5550100", 1, "in group");
        grouped.set_group_id(group.id);
        let mut loose = sms("5550199", 2, "loose");
        model.add_event(&mut grouped).unwrap();
        model.add_event(&mut loose).unwrap();

        model.delete_groups(&[group.id]).unwrap();
        assert_eq!(top_ids(&model), vec![loose.id()]);
    }

    #[test]
    fn next_update_without_sources_returns_immediately() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let mut model = sync_model();
        assert!(!rt.block_on(model.next_update()).unwrap());
    }
}
