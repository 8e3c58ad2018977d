//! Update bus: best-effort change propagation between models.
//!
//! Every model endpoint publishes its committed writes and replays what
//! other endpoints published. Messages carry the sender's origin id so an
//! endpoint never sees its own writes twice.

use commlog_core::{Event, Group};
use commlog_settings::BusSettings;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// A committed change.
#[derive(Clone, Debug)]
pub enum BusMessage {
    /// New events, ids assigned.
    EventsAdded(Vec<Event>),
    /// Modified events; only their modified properties are meaningful.
    EventsUpdated(Vec<Event>),
    /// A deleted event id.
    EventDeleted(i32),
    /// New groups.
    GroupsAdded(Vec<Group>),
    /// Modified groups.
    GroupsUpdated(Vec<Group>),
    /// Deleted group ids.
    GroupsDeleted(Vec<i32>),
}

impl BusMessage {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EventsAdded(_) => "events_added",
            Self::EventsUpdated(_) => "events_updated",
            Self::EventDeleted(_) => "event_deleted",
            Self::GroupsAdded(_) => "groups_added",
            Self::GroupsUpdated(_) => "groups_updated",
            Self::GroupsDeleted(_) => "groups_deleted",
        }
    }
}

/// A message plus the endpoint that sent it.
#[derive(Clone, Debug)]
pub struct BusEnvelope {
    /// Sending endpoint.
    pub origin: Uuid,
    /// Payload.
    pub message: BusMessage,
}

/// What an endpoint receives.
#[derive(Clone, Debug)]
pub enum Inbound {
    /// A message from another endpoint.
    Message(BusMessage),
    /// This many messages were lost; the receiver should reconcile.
    Lagged(u64),
}

/// The shared bus. Cloning yields another handle to the same channel.
#[derive(Clone, Debug)]
pub struct UpdateBus {
    tx: broadcast::Sender<BusEnvelope>,
}

impl UpdateBus {
    /// New bus with room for `capacity` undelivered messages per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New bus sized from settings.
    pub fn from_settings(settings: &BusSettings) -> Self {
        Self::new(settings.capacity)
    }

    /// Attach a new endpoint with a fresh origin id.
    pub fn endpoint(&self) -> BusEndpoint {
        BusEndpoint {
            id: Uuid::now_v7(),
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::from_settings(&BusSettings::default())
    }
}

/// One participant on the bus.
#[derive(Debug)]
pub struct BusEndpoint {
    id: Uuid,
    tx: broadcast::Sender<BusEnvelope>,
    rx: broadcast::Receiver<BusEnvelope>,
}

impl BusEndpoint {
    /// Origin id stamped on published messages.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Publish a committed change. Returns the number of other endpoints
    /// that will see it.
    pub fn publish(&self, message: BusMessage) -> usize {
        let kind = message.kind();
        let envelope = BusEnvelope {
            origin: self.id,
            message,
        };
        // Our own receiver counts as one.
        let receivers = self.tx.send(envelope).map_or(0, |n| n.saturating_sub(1));
        debug!(kind, receivers, "published bus message");
        receivers
    }

    /// Wait for the next message from another endpoint.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if let Some(inbound) = self.accept(envelope) {
                        return Some(inbound);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "update bus lagged");
                    return Some(Inbound::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Inbound> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => {
                    if let Some(inbound) = self.accept(envelope) {
                        return Some(inbound);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(lagged = n, "update bus lagged");
                    return Some(Inbound::Lagged(n));
                }
                Err(_) => return None,
            }
        }
    }

    fn accept(&self, envelope: BusEnvelope) -> Option<Inbound> {
        if envelope.origin == self.id {
            return None;
        }
        debug!(kind = envelope.message.kind(), origin = %envelope.origin, "bus message received");
        Some(Inbound::Message(envelope.message))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
