//! Change notifications emitted by an event model.
//!
//! Structural changes arrive as begin/end pairs with row-range semantics,
//! one pair per logical operation, so a list view can mirror the tree
//! without re-reading it.

use commlog_core::Event;
use tokio::sync::broadcast;

use crate::tree::NodeId;

/// One model change.
#[derive(Clone, Debug)]
pub enum ModelNotification {
    /// Rows `first..=last` of `parent` are about to be inserted.
    RowsAboutToBeInserted {
        /// Parent node.
        parent: NodeId,
        /// First new row.
        first: usize,
        /// Last new row.
        last: usize,
    },
    /// Rows `first..=last` of `parent` were inserted.
    RowsInserted {
        /// Parent node.
        parent: NodeId,
        /// First new row.
        first: usize,
        /// Last new row.
        last: usize,
    },
    /// Rows `first..=last` of `parent` are about to be removed.
    RowsAboutToBeRemoved {
        /// Parent node.
        parent: NodeId,
        /// First removed row.
        first: usize,
        /// Last removed row.
        last: usize,
    },
    /// Rows `first..=last` of `parent` were removed.
    RowsRemoved {
        /// Parent node.
        parent: NodeId,
        /// First removed row.
        first: usize,
        /// Last removed row.
        last: usize,
    },
    /// Row `from` of `parent` is about to move to `to`.
    RowsAboutToBeMoved {
        /// Parent node.
        parent: NodeId,
        /// Source row.
        from: usize,
        /// Destination row.
        to: usize,
    },
    /// Row `from` of `parent` moved to `to`.
    RowsMoved {
        /// Parent node.
        parent: NodeId,
        /// Source row.
        from: usize,
        /// Destination row.
        to: usize,
    },
    /// The event held by `node` changed, or its contacts did.
    DataChanged {
        /// Changed node.
        node: NodeId,
    },
    /// Every row is about to be dropped.
    ModelAboutToBeReset,
    /// Every row was dropped.
    ModelReset,
    /// A fetch finished (async) or delivered its first chunk (streamed).
    Ready {
        /// `false` when storage failed.
        success: bool,
    },
    /// A local write was rolled back; nothing in `events` was stored.
    CommitFailed {
        /// The batch that was attempted.
        events: Vec<Event>,
    },
}

/// Sending half shared by a model and its tree.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: broadcast::Sender<ModelNotification>,
}

impl Notifier {
    /// Create a notifier buffering up to `capacity` notifications per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelNotification> {
        self.tx.subscribe()
    }

    /// Send to every subscriber; having none is fine.
    pub fn emit(&self, notification: ModelNotification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}
