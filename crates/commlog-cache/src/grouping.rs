//! Call grouping: rolling raw call events up into conversation rows.
//!
//! A row node holds the representative (newest) event of its group with the
//! derived count in [`Event::event_count`]; its children are every raw event
//! of the row, newest first, so the representative is always child 0.
//!
//! | Policy | Same group when | Count | Candidate rows |
//! |---|---|---|---|
//! | `ByContact` | recipients match, same video flag | missed prefix | all |
//! | `ByContactAndType` | also same direction and missed flag | missed prefix | all |
//! | `ByTime` | also same direction and missed flag | children | adjacent |
//! | `ByType`, `ByService` | never (one row per event) | 1 | none |

use std::collections::HashSet;

use commlog_core::{Event, Property, RecipientKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{CacheError, Result};
use crate::tree::{EventTree, NodeId};

/// How calls are grouped into rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortPolicy {
    /// One row per contact, regardless of time.
    ByContact,
    /// Consecutive runs of the same contact, direction and outcome.
    #[default]
    ByTime,
    /// One row per contact, direction and outcome.
    ByContactAndType,
    /// Legacy; not grouped.
    ByType,
    /// Legacy; not grouped.
    ByService,
}

impl SortPolicy {
    /// Whether this policy rolls events up at all.
    pub fn groups(self) -> bool {
        matches!(self, Self::ByContact | Self::ByTime | Self::ByContactAndType)
    }

    fn splits_by_type(self) -> bool {
        matches!(self, Self::ByTime | Self::ByContactAndType)
    }
}

/// Whether `a` and `b` belong in the same row under `policy`.
pub fn same_group(policy: SortPolicy, a: &Event, b: &Event) -> bool {
    if !policy.groups() {
        return false;
    }
    let same_contact =
        a.recipients().matches(b.recipients()) && a.is_video_call() == b.is_video_call();
    if policy.splits_by_type() {
        same_contact
            && a.direction() == b.direction()
            && a.is_missed_call() == b.is_missed_call()
    } else {
        same_contact
    }
}

/// Derived count for a row whose events are `children`, newest first.
pub fn row_count_of<'a>(policy: SortPolicy, children: impl IntoIterator<Item = &'a Event>) -> i32 {
    let mut children = children.into_iter().peekable();
    let count = match policy {
        SortPolicy::ByTime => children.count(),
        SortPolicy::ByContact | SortPolicy::ByContactAndType => {
            if children.peek().is_some_and(|rep| rep.is_missed_call()) {
                children.take_while(|e| e.is_missed_call()).count()
            } else {
                0
            }
        }
        SortPolicy::ByType | SortPolicy::ByService => 1,
    };
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Identity of a group, used to track rows invalidated by a regrouping
/// change. Two events share a key exactly when [`same_group`] holds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupKey {
    recipients: Vec<RecipientKey>,
    video: bool,
    kind: Option<(i32, bool)>,
}

impl GroupKey {
    /// Key of the group `event` belongs to under `policy`.
    pub fn of(policy: SortPolicy, event: &Event) -> Self {
        let mut recipients = event.recipients().keys();
        recipients.sort();
        Self {
            recipients,
            video: event.is_video_call(),
            kind: policy
                .splits_by_type()
                .then(|| (event.direction().as_i32(), event.is_missed_call())),
        }
    }
}

/// Result of applying a property update to a grouped view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The event is not in the view.
    NotFound,
    /// The patch was applied to the cached event.
    Applied {
        /// Siblings whose read flag was changed to match; they still have to
        /// be written to storage.
        read_propagated: Vec<i32>,
        /// The event's group key changed. The rows returned by
        /// [`CallGrouping::dirty_rows`] must be rebuilt.
        regroup: bool,
    },
}

/// Grouping state for a call model.
#[derive(Clone, Debug, Default)]
pub struct CallGrouping {
    policy: SortPolicy,
    dirty: HashSet<GroupKey>,
}

impl CallGrouping {
    /// Grouping under `policy`.
    pub fn new(policy: SortPolicy) -> Self {
        Self {
            policy,
            dirty: HashSet::new(),
        }
    }

    /// Active policy.
    pub fn policy(&self) -> SortPolicy {
        self.policy
    }

    /// Groups invalidated since the last [`rebuild`](Self::rebuild) or
    /// [`reset`](Self::reset).
    pub fn dirty_keys(&self) -> &HashSet<GroupKey> {
        &self.dirty
    }

    /// Forget invalidated groups; called when the view is rebuilt.
    pub fn reset(&mut self) {
        self.dirty.clear();
    }

    /// Count of `row` recomputed from its children.
    pub fn count(&self, tree: &EventTree, row: NodeId) -> i32 {
        row_count_of(
            self.policy,
            tree.children(row).iter().filter_map(|c| tree.event(*c)),
        )
    }

    fn refresh_count(&self, tree: &mut EventTree, row: NodeId) -> Result<()> {
        let count = self.count(tree, row);
        if tree.event(row).is_some_and(|e| e.event_count() != count) {
            let mut patch = Event::default();
            patch.set_event_count(count);
            tree.update(row, &patch)?;
        }
        Ok(())
    }

    fn representative(event: &Event, count: i32) -> Event {
        let mut rep = event.clone();
        rep.set_event_count(count);
        rep.reset_modified();
        rep
    }

    /// Row and child nodes holding `event_id`.
    fn locate(tree: &EventTree, event_id: i32) -> Option<(NodeId, NodeId)> {
        tree.children(tree.root()).iter().find_map(|row| {
            tree.children(*row)
                .iter()
                .find(|c| tree.event(**c).is_some_and(|e| e.id() == event_id))
                .map(|c| (*row, *c))
        })
    }

    fn top_row(tree: &EventTree, event_id: i32) -> Option<NodeId> {
        tree.children(tree.root())
            .iter()
            .find(|r| tree.event(**r).is_some_and(|e| e.id() == event_id))
            .copied()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bulk fill
    // ─────────────────────────────────────────────────────────────────────

    /// Merge a newest-first batch of fetched events, appending it after the
    /// rows already present.
    pub fn fill(&mut self, tree: &mut EventTree, events: Vec<Event>) -> Result<()> {
        let root = tree.root();
        if !self.policy.groups() {
            let rows: Vec<Event> = events
                .iter()
                .map(|e| Self::representative(e, 1))
                .collect();
            let at = tree.row_count(root);
            let _ = tree.insert_many(root, at, rows)?;
            return Ok(());
        }

        let existing: Vec<NodeId> = tree.children(root).to_vec();
        let mut appended: Vec<(NodeId, Vec<Event>)> = Vec::new();
        let mut fresh: Vec<Vec<Event>> = Vec::new();

        for event in events {
            let matches_existing = |row: &NodeId| {
                tree.event(*row)
                    .is_some_and(|rep| same_group(self.policy, rep, &event))
            };
            let matches_fresh =
                |rows: &Vec<Event>| rows.first().is_some_and(|rep| same_group(self.policy, rep, &event));

            let (existing_row, fresh_row) = if self.policy == SortPolicy::ByTime {
                // Only the last row is open.
                match fresh.last() {
                    Some(rows) => (None, matches_fresh(rows).then(|| fresh.len() - 1)),
                    None => (existing.last().copied().filter(|r| matches_existing(r)), None),
                }
            } else {
                match existing.iter().copied().find(|r| matches_existing(r)) {
                    Some(row) => (Some(row), None),
                    None => (None, fresh.iter().position(|rows| matches_fresh(rows))),
                }
            };

            if let Some(row) = existing_row {
                match appended.iter_mut().find(|(r, _)| *r == row) {
                    Some((_, children)) => children.push(event),
                    None => appended.push((row, vec![event])),
                }
            } else if let Some(index) = fresh_row {
                fresh[index].push(event);
            } else {
                fresh.push(vec![event]);
            }
        }

        for (row, children) in appended {
            let at = tree.row_count(row);
            let _ = tree.insert_many(row, at, children)?;
            self.refresh_count(tree, row)?;
        }

        if !fresh.is_empty() {
            let reps: Vec<Event> = fresh
                .iter()
                .filter_map(|rows| {
                    let rep = rows.first()?;
                    Some(Self::representative(rep, row_count_of(self.policy, rows)))
                })
                .collect();
            let at = tree.row_count(root);
            let rows = tree.insert_many(root, at, reps)?;
            for (row, children) in rows.into_iter().zip(fresh) {
                let _ = tree.insert_many(row, 0, children)?;
            }
        }
        debug!(rows = tree.row_count(root), policy = ?self.policy, "grouped fill merged");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Incremental changes
    // ─────────────────────────────────────────────────────────────────────

    /// Insert one new event. Returns the row it landed in.
    ///
    /// A matching row receives the event as its newest child and moves to
    /// the top; otherwise a new row is created at the top.
    pub fn insert(&mut self, tree: &mut EventTree, event: Event) -> Result<NodeId> {
        let root = tree.root();
        if !self.policy.groups() {
            let at = tree.newest_first_position(root, &event);
            return tree.insert(root, at, Self::representative(&event, 1));
        }

        let candidates: Vec<NodeId> = if self.policy == SortPolicy::ByTime {
            tree.child_at(root, 0).into_iter().collect()
        } else {
            tree.children(root).to_vec()
        };
        let target = candidates.into_iter().find(|row| {
            tree.event(*row)
                .is_some_and(|rep| same_group(self.policy, rep, &event))
        });

        match target {
            Some(row) => {
                let _ = tree.insert(row, 0, event.clone())?;
                let rep = Self::representative(&event, self.count(tree, row));
                tree.set_event(row, rep)?;
                let from = tree.row_of(row).ok_or(CacheError::InvalidNode(row))?;
                tree.move_child(root, from, 0)?;
                Ok(row)
            }
            None => {
                let rep = Self::representative(&event, row_count_of(self.policy, [&event]));
                let row = tree.insert(root, 0, rep)?;
                let _ = tree.insert(row, 0, event)?;
                Ok(row)
            }
        }
    }

    /// Apply `event`'s modified properties to the view.
    ///
    /// A change to any property the grouping looks at (video flag,
    /// recipients, and under the type-splitting policies direction and
    /// missed flag) is applied to the cached event, but the row is not
    /// re-grouped locally: both the old and new group keys are marked dirty
    /// and the caller rebuilds [`dirty_rows`](Self::dirty_rows) from
    /// storage.
    pub fn update(&mut self, tree: &mut EventTree, event: &Event) -> Result<UpdateOutcome> {
        let mut patch = event.clone();
        let mut modified = patch.modified_properties();
        modified.remove(Property::EventCount);
        patch.set_modified_properties(modified);

        if !self.policy.groups() {
            let Some(node) = Self::top_row(tree, event.id()) else {
                return Ok(UpdateOutcome::NotFound);
            };
            tree.update(node, &patch)?;
            return Ok(UpdateOutcome::Applied {
                read_propagated: Vec::new(),
                regroup: false,
            });
        }

        let Some((row, child)) = Self::locate(tree, event.id()) else {
            return Ok(UpdateOutcome::NotFound);
        };

        let before = tree.event(child).map(|e| GroupKey::of(self.policy, e));
        tree.update(child, &patch)?;
        if tree.child_at(row, 0) == Some(child) {
            tree.update(row, &patch)?;
        }
        let after = tree.event(child).map(|e| GroupKey::of(self.policy, e));
        let regroup = before != after;
        if regroup {
            debug!(event_id = event.id(), "group key changed");
            self.dirty.extend(before.into_iter().chain(after));
        }

        let mut read_propagated = Vec::new();
        if modified.contains(Property::IsRead) {
            let read = event.is_read();
            let mut read_patch = Event::default();
            read_patch.set_is_read(read);

            for sibling in tree.children(row).to_vec() {
                if sibling == child {
                    continue;
                }
                let Some(stored) = tree.event(sibling) else {
                    continue;
                };
                if stored.is_read() != read {
                    read_propagated.push(stored.id());
                    tree.update(sibling, &read_patch)?;
                }
            }
            if tree.event(row).is_some_and(|e| e.is_read() != read) {
                tree.update(row, &read_patch)?;
            }
        }

        self.refresh_count(tree, row)?;
        Ok(UpdateOutcome::Applied {
            read_propagated,
            regroup,
        })
    }

    /// Rows to rebuild after `event_id` changed group.
    ///
    /// Under `ByTime` that is the event's row and its immediate neighbours,
    /// since a split piece can only join an adjacent run. Otherwise it is
    /// every row holding an event whose key is dirty.
    pub fn dirty_rows(&self, tree: &EventTree, event_id: i32) -> Vec<NodeId> {
        let rows = tree.children(tree.root());
        if self.policy == SortPolicy::ByTime {
            let Some(index) = Self::locate(tree, event_id).and_then(|(row, _)| tree.row_of(row))
            else {
                return Vec::new();
            };
            let last = (index + 1).min(rows.len() - 1);
            return rows[index.saturating_sub(1)..=last].to_vec();
        }
        rows.iter()
            .copied()
            .filter(|row| {
                tree.children(*row).iter().any(|c| {
                    tree.event(*c).is_some_and(|e| {
                        e.id() == event_id || self.dirty.contains(&GroupKey::of(self.policy, e))
                    })
                })
            })
            .collect()
    }

    /// Replace `rows` with rows built from `events`, the re-read contents
    /// of those rows. Every other row keeps its node.
    pub fn rebuild(&mut self, tree: &mut EventTree, rows: &[NodeId], mut events: Vec<Event>) -> Result<()> {
        let root = tree.root();
        let start = rows.first().and_then(|r| tree.row_of(*r)).unwrap_or(0);
        for row in rows {
            let _ = tree.remove(*row)?;
        }

        events.sort_by(|a, b| (b.start_time(), b.id()).cmp(&(a.start_time(), a.id())));
        let groups = self.partition(events);
        let built = groups.len();

        if self.policy == SortPolicy::ByTime {
            for (offset, children) in groups.into_iter().enumerate() {
                let _ = self.insert_row(tree, start + offset, children)?;
            }
            // The outer pieces may now continue the runs on either side.
            let end = start + built;
            if end > 0 && end < tree.row_count(root) {
                let _ = self.merge_at(tree, end - 1)?;
            }
            if start > 0 && start < tree.row_count(root) {
                let _ = self.merge_at(tree, start - 1)?;
            }
        } else {
            for children in groups {
                let Some(rep) = children.first() else {
                    continue;
                };
                let at = tree.newest_first_position(root, rep);
                let _ = self.insert_row(tree, at, children)?;
            }
        }
        self.dirty.clear();
        debug!(removed = rows.len(), built, policy = ?self.policy, "rebuilt regrouped rows");
        Ok(())
    }

    /// Split newest-first `events` into rows.
    fn partition(&self, events: Vec<Event>) -> Vec<Vec<Event>> {
        let mut groups: Vec<Vec<Event>> = Vec::new();
        for event in events {
            let joins = |rows: &&mut Vec<Event>| {
                rows.first()
                    .is_some_and(|rep| same_group(self.policy, rep, &event))
            };
            let target = if self.policy == SortPolicy::ByTime {
                groups.last_mut().filter(joins)
            } else {
                groups.iter_mut().find(joins)
            };
            match target {
                Some(rows) => rows.push(event),
                None => groups.push(vec![event]),
            }
        }
        groups
    }

    fn insert_row(&self, tree: &mut EventTree, at: usize, children: Vec<Event>) -> Result<NodeId> {
        let rep = children
            .first()
            .map(|e| Self::representative(e, row_count_of(self.policy, &children)))
            .ok_or_else(|| CacheError::Unsupported("empty call row".into()))?;
        let root = tree.root();
        let row = tree.insert(root, at, rep)?;
        let _ = tree.insert_many(row, 0, children)?;
        Ok(row)
    }

    /// Merge top-level row `index + 1` into row `index` when they belong
    /// together.
    fn merge_at(&mut self, tree: &mut EventTree, index: usize) -> Result<bool> {
        let root = tree.root();
        let (Some(newer), Some(older)) = (tree.child_at(root, index), tree.child_at(root, index + 1))
        else {
            return Ok(false);
        };
        let mergeable = match (tree.event(newer), tree.event(older)) {
            (Some(a), Some(b)) => same_group(self.policy, a, b),
            _ => false,
        };
        if !mergeable {
            return Ok(false);
        }

        let moved: Vec<Event> = tree
            .children(older)
            .iter()
            .filter_map(|c| tree.event(*c).cloned())
            .collect();
        let _ = tree.remove(older)?;
        let at = tree.row_count(newer);
        let _ = tree.insert_many(newer, at, moved)?;
        self.refresh_count(tree, newer)?;
        debug!(row = index, "merged neighbouring rows");
        Ok(true)
    }

    /// The row represented by `event_id` and the ids of every event in it.
    ///
    /// `Ok(None)` when the id is not in the view. Deleting a single
    /// non-representative event of a row, or deleting anything under a
    /// legacy policy, is unsupported.
    pub fn row_event_ids(&self, tree: &EventTree, event_id: i32) -> Result<Option<(NodeId, Vec<i32>)>> {
        if !self.policy.groups() {
            return Err(CacheError::Unsupported(format!(
                "delete under {:?} grouping",
                self.policy
            )));
        }
        if let Some(row) = Self::top_row(tree, event_id) {
            let ids = tree
                .children(row)
                .iter()
                .filter_map(|c| tree.event(*c).map(Event::id))
                .collect();
            return Ok(Some((row, ids)));
        }
        if Self::locate(tree, event_id).is_some() {
            return Err(CacheError::Unsupported(
                "deleting a single event of a grouped row".into(),
            ));
        }
        Ok(None)
    }

    /// Remove a whole row. Under `ByTime` the rows on either side are merged
    /// when they now belong together.
    pub fn remove_row(&mut self, tree: &mut EventTree, row: NodeId) -> Result<()> {
        let index = tree.row_of(row).ok_or(CacheError::InvalidNode(row))?;
        let _ = tree.remove(row)?;
        if self.policy == SortPolicy::ByTime && index > 0 {
            let _ = self.merge_at(tree, index - 1)?;
        }
        Ok(())
    }

    /// Remove one event reported deleted elsewhere.
    ///
    /// Only a row holding exactly that event can be dropped; anything else
    /// is unsupported and the caller should refetch.
    pub fn remove_event(&mut self, tree: &mut EventTree, event_id: i32) -> Result<bool> {
        match self.row_event_ids(tree, event_id)? {
            Some((row, ids)) if ids.len() <= 1 => {
                self.remove_row(tree, row)?;
                Ok(true)
            }
            Some(_) => Err(CacheError::Unsupported(
                "deleting one event of a multi-event row".into(),
            )),
            None => Ok(false),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use commlog_core::{Direction, EventType, RecipientList};

    #[derive(Clone, Copy)]
    enum Kind {
        Missed,
        Received,
        Dialed,
    }

    fn call(id: i32, remote: &str, kind: Kind) -> Event {
        let mut e = Event::new(EventType::Call);
        e.set_id(id);
        e.set_local_uid("ring/tel/account0");
        e.set_recipients(RecipientList::from_remotes("ring/tel/account0", [remote]));
        e.set_start_time(Utc.timestamp_opt(1_700_000_000 + i64::from(id) * 60, 0).unwrap());
        match kind {
            Kind::Missed => {
                e.set_direction(Direction::Inbound);
                e.set_is_missed_call(true);
            }
            Kind::Received => e.set_direction(Direction::Inbound),
            Kind::Dialed => e.set_direction(Direction::Outbound),
        }
        e.reset_modified();
        e
    }

    fn tree() -> EventTree {
        EventTree::new(Notifier::new(1024))
    }

    fn rows(tree: &EventTree) -> Vec<(i32, i32, usize)> {
        tree.children(tree.root())
            .iter()
            .map(|r| {
                let e = tree.event(*r).unwrap();
                (e.id(), e.event_count(), tree.row_count(*r))
            })
            .collect()
    }

    #[test]
    fn missed_run_count_by_contact() {
        let events = [
            call(4, "5550100", Kind::Missed),
            call(3, "5550100", Kind::Missed),
            call(2, "5550100", Kind::Dialed),
            call(1, "5550100", Kind::Missed),
        ];
        assert_eq!(row_count_of(SortPolicy::ByContact, &events), 2);
        assert_eq!(row_count_of(SortPolicy::ByContact, &events[..1]), 1);
        assert_eq!(row_count_of(SortPolicy::ByContact, &events[2..]), 0);
        assert_eq!(row_count_of(SortPolicy::ByTime, &events), 4);
    }

    #[test]
    fn same_group_rules() {
        let missed = call(1, "5550100", Kind::Missed);
        let dialed = call(2, "+1 555 0100", Kind::Dialed);
        assert!(same_group(SortPolicy::ByContact, &missed, &dialed));
        assert!(!same_group(SortPolicy::ByTime, &missed, &dialed));
        assert!(!same_group(SortPolicy::ByContactAndType, &missed, &dialed));
        assert!(!same_group(SortPolicy::ByType, &missed, &missed));

        let mut video = call(3, "5550100", Kind::Missed);
        video.set_is_video_call(true);
        assert!(!same_group(SortPolicy::ByContact, &missed, &video));
    }

    #[test]
    fn fill_by_contact_scans_all_rows() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByContact);
        grouping
            .fill(
                &mut tree,
                vec![
                    call(5, "5550100", Kind::Missed),
                    call(4, "5550199", Kind::Dialed),
                    call(3, "5550100", Kind::Missed),
                    call(2, "5550199", Kind::Received),
                    call(1, "5550100", Kind::Dialed),
                ],
            )
            .unwrap();
        assert_eq!(rows(&tree), vec![(5, 2, 3), (4, 0, 2)]);

        // A later chunk appends to existing rows.
        grouping
            .fill(&mut tree, vec![call(0, "5550100", Kind::Missed)])
            .unwrap();
        assert_eq!(rows(&tree), vec![(5, 2, 4), (4, 0, 2)]);
    }

    #[test]
    fn fill_by_time_checks_last_row_only() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByTime);
        grouping
            .fill(
                &mut tree,
                vec![
                    call(5, "5550100", Kind::Missed),
                    call(4, "5550100", Kind::Missed),
                    call(3, "5550199", Kind::Missed),
                    call(2, "5550100", Kind::Missed),
                ],
            )
            .unwrap();
        assert_eq!(rows(&tree), vec![(5, 2, 2), (3, 1, 1), (2, 1, 1)]);

        grouping
            .fill(&mut tree, vec![call(1, "5550100", Kind::Missed)])
            .unwrap();
        assert_eq!(rows(&tree), vec![(5, 2, 2), (3, 1, 1), (2, 2, 2)]);
    }

    #[test]
    fn representative_is_first_child() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByContact);
        grouping
            .fill(
                &mut tree,
                vec![call(2, "5550100", Kind::Dialed), call(1, "5550100", Kind::Missed)],
            )
            .unwrap();
        let row = tree.child_at(tree.root(), 0).unwrap();
        let first = tree.child_at(row, 0).unwrap();
        assert_eq!(tree.event(row).unwrap().id(), tree.event(first).unwrap().id());
    }

    #[test]
    fn insert_moves_row_to_top_keeping_identity() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByContact);
        grouping
            .fill(
                &mut tree,
                vec![call(3, "5550199", Kind::Dialed), call(2, "5550100", Kind::Missed)],
            )
            .unwrap();
        let root = tree.root();
        let row = tree.child_at(root, 1).unwrap();

        let landed = grouping
            .insert(&mut tree, call(4, "5550100", Kind::Missed))
            .unwrap();
        assert_eq!(landed, row);
        assert_eq!(tree.child_at(root, 0), Some(row));
        assert_eq!(rows(&tree), vec![(4, 2, 2), (3, 0, 1)]);
    }

    #[test]
    fn insert_by_time_checks_top_row_only() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByTime);
        grouping
            .fill(
                &mut tree,
                vec![call(3, "5550199", Kind::Dialed), call(2, "5550100", Kind::Missed)],
            )
            .unwrap();
        let _ = grouping
            .insert(&mut tree, call(4, "5550100", Kind::Missed))
            .unwrap();
        assert_eq!(rows(&tree), vec![(4, 1, 1), (3, 1, 1), (2, 1, 1)]);

        let _ = grouping
            .insert(&mut tree, call(5, "5550100", Kind::Missed))
            .unwrap();
        assert_eq!(rows(&tree), vec![(5, 2, 2), (3, 1, 1), (2, 1, 1)]);
    }

    #[test]
    fn legacy_policies_do_not_group() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByType);
        grouping
            .fill(
                &mut tree,
                vec![call(2, "5550100", Kind::Missed), call(1, "5550100", Kind::Missed)],
            )
            .unwrap();
        assert_eq!(rows(&tree), vec![(2, 1, 0), (1, 1, 0)]);
        let _ = grouping
            .insert(&mut tree, call(3, "5550100", Kind::Missed))
            .unwrap();
        assert_eq!(tree.row_count(tree.root()), 3);
        assert_matches!(
            grouping.remove_event(&mut tree, 3),
            Err(CacheError::Unsupported(_))
        );
        assert_matches!(
            grouping.row_event_ids(&tree, 3),
            Err(CacheError::Unsupported(_))
        );
    }

    #[test]
    fn delete_merges_neighbours_by_time() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByTime);
        grouping
            .fill(
                &mut tree,
                vec![
                    call(3, "5550100", Kind::Missed),
                    call(2, "5550199", Kind::Dialed),
                    call(1, "5550100", Kind::Missed),
                ],
            )
            .unwrap();
        let (row, ids) = grouping.row_event_ids(&tree, 2).unwrap().unwrap();
        assert_eq!(ids, vec![2]);
        grouping.remove_row(&mut tree, row).unwrap();
        assert_eq!(rows(&tree), vec![(3, 2, 2)]);
    }

    #[test]
    fn delete_keeps_unrelated_neighbours() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByTime);
        grouping
            .fill(
                &mut tree,
                vec![
                    call(3, "5550100", Kind::Missed),
                    call(2, "5550199", Kind::Dialed),
                    call(1, "5550100", Kind::Dialed),
                ],
            )
            .unwrap();
        assert!(grouping.remove_event(&mut tree, 2).unwrap());
        assert_eq!(rows(&tree), vec![(3, 1, 1), (1, 1, 1)]);
    }

    #[test]
    fn deleting_child_is_unsupported() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByContact);
        grouping
            .fill(
                &mut tree,
                vec![call(2, "5550100", Kind::Missed), call(1, "5550100", Kind::Missed)],
            )
            .unwrap();
        assert_matches!(
            grouping.row_event_ids(&tree, 1),
            Err(CacheError::Unsupported(_))
        );
        assert_matches!(
            grouping.remove_event(&mut tree, 2),
            Err(CacheError::Unsupported(_))
        );
        assert!(!grouping.remove_event(&mut tree, 99).unwrap());

        let (_, ids) = grouping.row_event_ids(&tree, 2).unwrap().unwrap();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn read_flag_propagates_to_row() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByContact);
        grouping
            .fill(
                &mut tree,
                vec![
                    call(3, "5550100", Kind::Missed),
                    call(2, "5550100", Kind::Missed),
                    call(1, "5550100", Kind::Dialed),
                ],
            )
            .unwrap();

        let mut patch = Event::default();
        patch.set_id(2);
        patch.set_is_read(true);
        let outcome = grouping.update(&mut tree, &patch).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                read_propagated: vec![3, 1],
                regroup: false
            }
        );
        assert!(tree.nodes().iter().all(|n| tree.event(*n).unwrap().is_read()));
    }

    #[test]
    fn update_recomputes_count() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByContact);
        grouping
            .fill(
                &mut tree,
                vec![call(2, "5550100", Kind::Missed), call(1, "5550100", Kind::Missed)],
            )
            .unwrap();
        assert_eq!(rows(&tree), vec![(2, 2, 2)]);

        let mut patch = Event::default();
        patch.set_id(1);
        patch.set_is_missed_call(false);
        assert_eq!(
            grouping.update(&mut tree, &patch).unwrap(),
            UpdateOutcome::Applied {
                read_propagated: vec![],
                regroup: false
            }
        );
        assert_eq!(rows(&tree), vec![(2, 1, 2)]);
    }

    /// Children of every top-level row, as `(row id, child ids)`.
    fn layout(tree: &EventTree) -> Vec<(i32, Vec<i32>)> {
        tree.children(tree.root())
            .iter()
            .map(|r| {
                let children = tree
                    .children(*r)
                    .iter()
                    .map(|c| tree.event(*c).unwrap().id())
                    .collect();
                (tree.event(*r).unwrap().id(), children)
            })
            .collect()
    }

    /// Events of `rows` as they now stand in the tree.
    fn contents(tree: &EventTree, rows: &[NodeId]) -> Vec<Event> {
        rows.iter()
            .flat_map(|r| tree.children(*r).iter())
            .map(|c| tree.event(*c).unwrap().clone())
            .collect()
    }

    #[test]
    fn video_change_rebuilds_only_its_rows() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByContact);
        grouping
            .fill(
                &mut tree,
                vec![
                    call(3, "5550100", Kind::Received),
                    call(2, "5550199", Kind::Dialed),
                    call(1, "5550100", Kind::Received),
                ],
            )
            .unwrap();
        let untouched = tree.child_at(tree.root(), 1).unwrap();

        let mut patch = Event::default();
        patch.set_id(1);
        patch.set_is_video_call(true);
        assert_eq!(
            grouping.update(&mut tree, &patch).unwrap(),
            UpdateOutcome::Applied {
                read_propagated: vec![],
                regroup: true
            }
        );
        assert_eq!(grouping.dirty_keys().len(), 2);

        let dirty = grouping.dirty_rows(&tree, 1);
        assert_eq!(dirty.len(), 1);
        assert!(!dirty.contains(&untouched));

        let events = contents(&tree, &dirty);
        grouping.rebuild(&mut tree, &dirty, events).unwrap();
        assert!(grouping.dirty_keys().is_empty());
        assert_eq!(layout(&tree), vec![(3, vec![3]), (2, vec![2]), (1, vec![1])]);
        assert!(tree.contains(untouched));
        assert_eq!(tree.child_at(tree.root(), 1), Some(untouched));
    }

    #[test]
    fn missed_edit_by_time_splits_row() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByTime);
        grouping
            .fill(
                &mut tree,
                vec![
                    call(3, "5550199", Kind::Dialed),
                    call(2, "5550100", Kind::Missed),
                    call(1, "5550100", Kind::Missed),
                ],
            )
            .unwrap();
        assert_eq!(rows(&tree), vec![(3, 1, 1), (2, 2, 2)]);

        let mut patch = Event::default();
        patch.set_id(1);
        patch.set_is_missed_call(false);
        assert_matches!(
            grouping.update(&mut tree, &patch).unwrap(),
            UpdateOutcome::Applied { regroup: true, .. }
        );

        let dirty = grouping.dirty_rows(&tree, 1);
        assert_eq!(dirty.len(), 2);
        let events = contents(&tree, &dirty);
        grouping.rebuild(&mut tree, &dirty, events).unwrap();
        assert_eq!(layout(&tree), vec![(3, vec![3]), (2, vec![2]), (1, vec![1])]);
        assert!(tree
            .children(tree.child_at(tree.root(), 1).unwrap())
            .iter()
            .all(|c| tree.event(*c).unwrap().is_missed_call()));
    }

    #[test]
    fn direction_edit_by_time_joins_neighbour() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByTime);
        grouping
            .fill(
                &mut tree,
                vec![
                    call(4, "5550199", Kind::Dialed),
                    call(3, "5550100", Kind::Dialed),
                    call(2, "5550100", Kind::Received),
                    call(1, "5550100", Kind::Dialed),
                ],
            )
            .unwrap();
        assert_eq!(rows(&tree).len(), 4);
        let top = tree.child_at(tree.root(), 0).unwrap();

        let mut patch = Event::default();
        patch.set_id(2);
        patch.set_direction(Direction::Outbound);
        let _ = grouping.update(&mut tree, &patch).unwrap();

        let dirty = grouping.dirty_rows(&tree, 2);
        assert_eq!(dirty.len(), 3);
        assert!(!dirty.contains(&top));
        let events = contents(&tree, &dirty);
        grouping.rebuild(&mut tree, &dirty, events).unwrap();
        assert_eq!(layout(&tree), vec![(4, vec![4]), (3, vec![3, 2, 1])]);
        assert_eq!(rows(&tree)[1], (3, 3, 3));
        assert_eq!(tree.child_at(tree.root(), 0), Some(top));
    }

    #[test]
    fn rebuild_without_events_rejoins_neighbours_by_time() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByTime);
        grouping
            .fill(
                &mut tree,
                vec![
                    call(3, "5550100", Kind::Missed),
                    call(2, "5550199", Kind::Dialed),
                    call(1, "5550100", Kind::Missed),
                ],
            )
            .unwrap();
        let middle = tree.child_at(tree.root(), 1).unwrap();
        grouping.rebuild(&mut tree, &[middle], Vec::new()).unwrap();
        assert_eq!(layout(&tree), vec![(3, vec![3, 1])]);
    }

    #[test]
    fn delete_by_contact_never_merges() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByContact);
        let mut video = call(2, "5550100", Kind::Missed);
        video.set_is_video_call(true);
        video.reset_modified();
        grouping
            .fill(
                &mut tree,
                vec![call(3, "5550100", Kind::Missed), video, call(1, "5550199", Kind::Missed)],
            )
            .unwrap();
        grouping
            .fill(&mut tree, vec![call(0, "5550100", Kind::Dialed)])
            .unwrap();
        assert_eq!(layout(&tree), vec![(3, vec![3, 0]), (2, vec![2]), (1, vec![1])]);

        assert!(grouping.remove_event(&mut tree, 2).unwrap());
        assert_eq!(layout(&tree), vec![(3, vec![3, 0]), (1, vec![1])]);
    }

    #[test]
    fn update_of_unknown_event() {
        let mut tree = tree();
        let mut grouping = CallGrouping::new(SortPolicy::ByTime);
        let mut patch = Event::default();
        patch.set_id(7);
        patch.set_is_read(true);
        assert_eq!(
            grouping.update(&mut tree, &patch).unwrap(),
            UpdateOutcome::NotFound
        );
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn identical_calls_collapse_by_time(n in 1usize..24) {
                let events: Vec<Event> = (0..n)
                    .rev()
                    .map(|i| call(i32::try_from(i).unwrap(), "5550100", Kind::Missed))
                    .collect();

                let mut filled = tree();
                let mut grouping = CallGrouping::new(SortPolicy::ByTime);
                grouping.fill(&mut filled, events.clone()).unwrap();

                let mut inserted = tree();
                let mut incremental = CallGrouping::new(SortPolicy::ByTime);
                for event in events.into_iter().rev() {
                    let _ = incremental.insert(&mut inserted, event).unwrap();
                }

                let expected = vec![(i32::try_from(n - 1).unwrap(), i32::try_from(n).unwrap(), n)];
                prop_assert_eq!(rows(&filled), expected.clone());
                prop_assert_eq!(rows(&inserted), expected);
            }
        }
    }
}
