//! Arena-backed tree of events.
//!
//! Nodes live in a slot arena and are addressed by [`NodeId`] handles
//! (slot index plus generation), so a handle to a removed node never aliases
//! a later one. A parent owns the ordered list of its children; a child only
//! records its parent's handle. The root is a sentinel without an event.
//!
//! Every structural mutation emits one begin/end notification pair; value
//! changes emit [`ModelNotification::DataChanged`].

use std::collections::HashSet;

use commlog_core::Event;

use crate::errors::{CacheError, Result};
use crate::notify::{ModelNotification, Notifier};

/// Stable handle to a tree node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// The root sentinel of every tree.
    pub const ROOT: NodeId = NodeId {
        index: 0,
        generation: 0,
    };
}

#[derive(Debug)]
struct Node {
    event: Option<Event>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// An ordered tree of events with change notifications.
#[derive(Debug)]
pub struct EventTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    notifier: Notifier,
}

impl EventTree {
    /// Empty tree emitting through `notifier`.
    pub fn new(notifier: Notifier) -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(Node {
                    event: None,
                    parent: None,
                    children: Vec::new(),
                }),
            }],
            free: Vec::new(),
            notifier,
        }
    }

    /// The root sentinel.
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Whether `id` refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Event held by `id`; `None` for the root or a dead handle.
    pub fn event(&self, id: NodeId) -> Option<&Event> {
        self.node(id).and_then(|n| n.event.as_ref())
    }

    /// Parent of `id`.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    /// Children of `id`, in row order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map_or(&[], |n| n.children.as_slice())
    }

    /// Child at `row` of `parent`.
    pub fn child_at(&self, parent: NodeId, row: usize) -> Option<NodeId> {
        self.children(parent).get(row).copied()
    }

    /// Number of children of `parent`.
    pub fn row_count(&self, parent: NodeId) -> usize {
        self.children(parent).len()
    }

    /// Row of `id` within its parent.
    pub fn row_of(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|c| *c == id)
    }

    /// Whether the root has no children.
    pub fn is_empty(&self) -> bool {
        self.row_count(NodeId::ROOT) == 0
    }

    /// Node holding the event with storage id `event_id`.
    ///
    /// Searches the top level first, then one level of children.
    pub fn find_by_id(&self, event_id: i32) -> Option<NodeId> {
        let has_id = |n: &NodeId| self.event(*n).is_some_and(|e| e.id() == event_id);
        let top = self.children(NodeId::ROOT);
        top.iter()
            .find(|n| has_id(*n))
            .or_else(|| top.iter().flat_map(|n| self.children(*n)).find(|n| has_id(*n)))
            .copied()
    }

    /// Storage ids held anywhere in the top two levels.
    pub fn event_ids(&self) -> HashSet<i32> {
        self.nodes()
            .into_iter()
            .filter_map(|n| self.event(n).map(Event::id))
            .collect()
    }

    /// Every node below the root, depth first.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(NodeId::ROOT).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    /// Row under `parent` where `event` belongs in newest-first order.
    pub fn newest_first_position(&self, parent: NodeId, event: &Event) -> usize {
        let key = (event.start_time(), event.id());
        self.children(parent)
            .iter()
            .position(|n| {
                self.event(*n)
                    .is_some_and(|e| (e.start_time(), e.id()) < key)
            })
            .unwrap_or_else(|| self.row_count(parent))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    fn release(&mut self, id: NodeId) -> Option<Event> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        for child in node.children {
            let _ = self.release(child);
        }
        node.event
    }

    /// Insert `event` as child `index` of `parent`; `index` is clamped to
    /// the row count.
    pub fn insert(&mut self, parent: NodeId, index: usize, event: Event) -> Result<NodeId> {
        self.insert_many(parent, index, vec![event])?
            .into_iter()
            .next()
            .ok_or(CacheError::InvalidNode(parent))
    }

    /// Insert a contiguous batch at `index` with a single notification pair.
    pub fn insert_many(
        &mut self,
        parent: NodeId,
        index: usize,
        events: Vec<Event>,
    ) -> Result<Vec<NodeId>> {
        let len = self
            .node(parent)
            .ok_or(CacheError::InvalidNode(parent))?
            .children
            .len();
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let first = index.min(len);
        let last = first + events.len() - 1;

        self.notifier.emit(ModelNotification::RowsAboutToBeInserted {
            parent,
            first,
            last,
        });
        let ids: Vec<NodeId> = events
            .into_iter()
            .map(|event| {
                self.alloc(Node {
                    event: Some(event),
                    parent: Some(parent),
                    children: Vec::new(),
                })
            })
            .collect();
        if let Some(node) = self.node_mut(parent) {
            let _ = node.children.splice(first..first, ids.iter().copied());
        }
        self.notifier.emit(ModelNotification::RowsInserted {
            parent,
            first,
            last,
        });
        Ok(ids)
    }

    /// Remove `id` and its subtree. Returns the removed event.
    pub fn remove(&mut self, id: NodeId) -> Result<Event> {
        let parent = self.parent(id).ok_or(CacheError::InvalidNode(id))?;
        let row = self.row_of(id).ok_or(CacheError::InvalidNode(id))?;

        self.notifier.emit(ModelNotification::RowsAboutToBeRemoved {
            parent,
            first: row,
            last: row,
        });
        if let Some(node) = self.node_mut(parent) {
            let _ = node.children.remove(row);
        }
        let event = self.release(id);
        self.notifier.emit(ModelNotification::RowsRemoved {
            parent,
            first: row,
            last: row,
        });
        event.ok_or(CacheError::InvalidNode(id))
    }

    /// Move child `from` of `parent` to row `to`.
    pub fn move_child(&mut self, parent: NodeId, from: usize, to: usize) -> Result<()> {
        let len = self.row_count(parent);
        if !self.contains(parent) || from >= len || to >= len {
            return Err(CacheError::InvalidNode(parent));
        }
        if from == to {
            return Ok(());
        }
        self.notifier
            .emit(ModelNotification::RowsAboutToBeMoved { parent, from, to });
        if let Some(node) = self.node_mut(parent) {
            let child = node.children.remove(from);
            node.children.insert(to, child);
        }
        self.notifier
            .emit(ModelNotification::RowsMoved { parent, from, to });
        Ok(())
    }

    /// Apply the modified properties of `event` to the event at `id`.
    pub fn update(&mut self, id: NodeId, event: &Event) -> Result<()> {
        let stored = self
            .node_mut(id)
            .and_then(|n| n.event.as_mut())
            .ok_or(CacheError::InvalidNode(id))?;
        stored.copy_valid_properties(event);
        self.notifier.emit(ModelNotification::DataChanged { node: id });
        Ok(())
    }

    /// Replace the event at `id`, keeping the node.
    pub fn set_event(&mut self, id: NodeId, event: Event) -> Result<()> {
        let slot = self
            .node_mut(id)
            .filter(|n| n.parent.is_some())
            .ok_or(CacheError::InvalidNode(id))?;
        slot.event = Some(event);
        self.notifier.emit(ModelNotification::DataChanged { node: id });
        Ok(())
    }

    /// Announce a change in data derived from the event at `id`.
    pub fn touch(&self, id: NodeId) {
        if self.event(id).is_some() {
            self.notifier.emit(ModelNotification::DataChanged { node: id });
        }
    }

    /// Drop every node.
    pub fn clear(&mut self) {
        self.notifier.emit(ModelNotification::ModelAboutToBeReset);
        let top = self
            .node_mut(NodeId::ROOT)
            .map(|root| std::mem::take(&mut root.children))
            .unwrap_or_default();
        for id in top {
            let _ = self.release(id);
        }
        self.notifier.emit(ModelNotification::ModelReset);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use commlog_core::EventType;
    use tokio::sync::broadcast;

    fn event(id: i32) -> Event {
        let mut e = Event::new(EventType::Call);
        e.set_id(id);
        e.set_start_time(Utc.timestamp_opt(1_700_000_000 + i64::from(id), 0).unwrap());
        e.reset_modified();
        e
    }

    fn tree() -> (EventTree, broadcast::Receiver<ModelNotification>) {
        let notifier = Notifier::new(256);
        let rx = notifier.subscribe();
        (EventTree::new(notifier), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<ModelNotification>) -> Vec<ModelNotification> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn insert_many_emits_one_pair() {
        let (mut tree, mut rx) = tree();
        let root = tree.root();
        let ids = tree
            .insert_many(root, 0, vec![event(1), event(2), event(3)])
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(tree.row_count(root), 3);

        let notes = drain(&mut rx);
        assert_eq!(notes.len(), 2);
        assert!(matches!(
            notes[0],
            ModelNotification::RowsAboutToBeInserted { first: 0, last: 2, .. }
        ));
        assert!(matches!(
            notes[1],
            ModelNotification::RowsInserted { first: 0, last: 2, .. }
        ));
    }

    #[test]
    fn insert_index_is_clamped() {
        let (mut tree, _rx) = tree();
        let root = tree.root();
        let _ = tree.insert(root, 0, event(1)).unwrap();
        let id = tree.insert(root, 99, event(2)).unwrap();
        assert_eq!(tree.row_of(id), Some(1));
    }

    #[test]
    fn insert_under_dead_parent_fails() {
        let (mut tree, _rx) = tree();
        let root = tree.root();
        let row = tree.insert(root, 0, event(1)).unwrap();
        let _ = tree.remove(row).unwrap();
        assert!(matches!(
            tree.insert(row, 0, event(2)),
            Err(CacheError::InvalidNode(_))
        ));
    }

    #[test]
    fn remove_is_recursive_and_invalidates_handles() {
        let (mut tree, _rx) = tree();
        let root = tree.root();
        let row = tree.insert(root, 0, event(1)).unwrap();
        let child = tree.insert(row, 0, event(1)).unwrap();
        let removed = tree.remove(row).unwrap();
        assert_eq!(removed.id(), 1);
        assert!(!tree.contains(row));
        assert!(!tree.contains(child));
        assert!(tree.is_empty());

        // Reused slots get a new generation.
        let fresh = tree.insert(root, 0, event(2)).unwrap();
        assert_ne!(fresh, row);
        assert_ne!(fresh, child);
        assert!(tree.event(row).is_none());
    }

    #[test]
    fn root_cannot_be_removed() {
        let (mut tree, _rx) = tree();
        assert!(tree.remove(NodeId::ROOT).is_err());
    }

    #[test]
    fn move_preserves_identity() {
        let (mut tree, mut rx) = tree();
        let root = tree.root();
        let ids = tree
            .insert_many(root, 0, vec![event(1), event(2), event(3)])
            .unwrap();
        let _ = drain(&mut rx);

        tree.move_child(root, 2, 0).unwrap();
        assert_eq!(tree.children(root), &[ids[2], ids[0], ids[1]]);
        assert_eq!(tree.event(ids[2]).unwrap().id(), 3);

        let notes = drain(&mut rx);
        assert!(matches!(
            notes.as_slice(),
            [
                ModelNotification::RowsAboutToBeMoved { from: 2, to: 0, .. },
                ModelNotification::RowsMoved { from: 2, to: 0, .. }
            ]
        ));
    }

    #[test]
    fn move_out_of_range_fails() {
        let (mut tree, _rx) = tree();
        let root = tree.root();
        let _ = tree.insert(root, 0, event(1)).unwrap();
        assert!(tree.move_child(root, 0, 3).is_err());
        assert!(tree.move_child(root, 0, 0).is_ok());
    }

    #[test]
    fn find_by_id_prefers_top_level() {
        let (mut tree, _rx) = tree();
        let root = tree.root();
        let row = tree.insert(root, 0, event(5)).unwrap();
        let child5 = tree.insert(row, 0, event(5)).unwrap();
        let child4 = tree.insert(row, 1, event(4)).unwrap();
        assert_eq!(tree.find_by_id(5), Some(row));
        assert_eq!(tree.find_by_id(4), Some(child4));
        assert_ne!(tree.find_by_id(5), Some(child5));
        assert_eq!(tree.find_by_id(9), None);
    }

    #[test]
    fn update_copies_only_modified_properties() {
        let (mut tree, mut rx) = tree();
        let root = tree.root();
        let mut original = event(1);
        original.set_free_text("keep");
        original.reset_modified();
        let id = tree.insert(root, 0, original).unwrap();
        let _ = drain(&mut rx);

        let mut patch = Event::default();
        patch.set_is_read(true);
        tree.update(id, &patch).unwrap();

        let stored = tree.event(id).unwrap();
        assert!(stored.is_read());
        assert_eq!(stored.free_text(), "keep");
        assert_eq!(stored.id(), 1);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ModelNotification::DataChanged { node }] if *node == id
        ));
    }

    #[test]
    fn set_event_keeps_node() {
        let (mut tree, _rx) = tree();
        let root = tree.root();
        let id = tree.insert(root, 0, event(1)).unwrap();
        tree.set_event(id, event(7)).unwrap();
        assert_eq!(tree.event(id).unwrap().id(), 7);
        assert_eq!(tree.child_at(root, 0), Some(id));
        assert!(tree.set_event(NodeId::ROOT, event(8)).is_err());
    }

    #[test]
    fn clear_resets_and_collects_ids() {
        let (mut tree, mut rx) = tree();
        let root = tree.root();
        let row = tree.insert(root, 0, event(1)).unwrap();
        let _ = tree.insert(row, 0, event(2)).unwrap();
        assert_eq!(tree.event_ids(), HashSet::from([1, 2]));
        let _ = drain(&mut rx);

        tree.clear();
        assert!(tree.is_empty());
        assert!(!tree.contains(row));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ModelNotification::ModelAboutToBeReset, ModelNotification::ModelReset]
        ));
    }

    #[test]
    fn newest_first_position_orders_by_time_then_id() {
        let (mut tree, _rx) = tree();
        let root = tree.root();
        let _ = tree
            .insert_many(root, 0, vec![event(30), event(20), event(10)])
            .unwrap();
        assert_eq!(tree.newest_first_position(root, &event(25)), 1);
        assert_eq!(tree.newest_first_position(root, &event(40)), 0);
        assert_eq!(tree.newest_first_position(root, &event(5)), 3);
    }

    #[test]
    fn nodes_are_depth_first() {
        let (mut tree, _rx) = tree();
        let root = tree.root();
        let a = tree.insert(root, 0, event(1)).unwrap();
        let b = tree.insert(root, 1, event(2)).unwrap();
        let a1 = tree.insert(a, 0, event(3)).unwrap();
        assert_eq!(tree.nodes(), vec![a, a1, b]);
    }
}
