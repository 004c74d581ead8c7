//! Room-scoped notification fan-out
//!
//! Delivery is a non-blocking push into each connection's bounded outbound
//! queue. A full or closed queue is logged and skipped; it never fails the
//! operation that produced the event.

use crate::protocol::{Event, OutboundSink, ServerMessage};
use crate::types::{PeerId, RoomId};
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Subscriber {
    peer_id: PeerId,
    sink: OutboundSink,
}

/// Push a message into a connection's queue without waiting
pub(crate) fn deliver(sink: &OutboundSink, peer_id: &PeerId, message: ServerMessage) -> bool {
    match sink.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            warn!(
                peer_id = %peer_id,
                message = ?message.event().map(Event::method),
                "Outbound queue full, dropping message"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(peer_id = %peer_id, "Outbound queue closed, dropping message");
            false
        }
    }
}

/// In-memory hub routing events to the members of each room
#[derive(Default)]
pub struct BroadcastHub {
    rooms: DashMap<RoomId, Vec<Subscriber>>,
}

impl BroadcastHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member's sink. Re-subscribing replaces the previous sink.
    pub fn subscribe(&self, room_id: &RoomId, peer_id: &PeerId, sink: OutboundSink) {
        let mut subscribers = self.rooms.entry(room_id.clone()).or_default();
        subscribers.retain(|s| &s.peer_id != peer_id);
        subscribers.push(Subscriber {
            peer_id: peer_id.clone(),
            sink,
        });
        debug!(room_id = %room_id, peer_id = %peer_id, "Peer subscribed to room events");
    }

    pub fn unsubscribe(&self, room_id: &RoomId, peer_id: &PeerId) -> bool {
        let Some(mut subscribers) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| &s.peer_id != peer_id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            drop(subscribers);
            self.rooms.remove_if(room_id, |_, subs| subs.is_empty());
        }
        if removed {
            debug!(room_id = %room_id, peer_id = %peer_id, "Peer unsubscribed from room events");
        }
        removed
    }

    /// Forget every subscriber of a room
    pub fn remove_room(&self, room_id: &RoomId) {
        self.rooms.remove(room_id);
    }

    /// Deliver an event to every member except `exclude`.
    /// Returns the number of successful deliveries.
    pub fn broadcast(&self, room_id: &RoomId, exclude: Option<&PeerId>, event: &Event) -> usize {
        let Some(subscribers) = self.rooms.get(room_id) else {
            return 0;
        };
        let mut sent_count = 0;
        for subscriber in subscribers.iter() {
            if exclude == Some(&subscriber.peer_id) {
                continue;
            }
            if deliver(
                &subscriber.sink,
                &subscriber.peer_id,
                ServerMessage::Notification(event.clone()),
            ) {
                sent_count += 1;
            }
        }
        debug!(
            room_id = %room_id,
            event = event.method(),
            sent_count,
            "Event broadcast complete"
        );
        sent_count
    }

    /// Deliver an event to a single member
    pub fn send_to(&self, room_id: &RoomId, peer_id: &PeerId, event: Event) -> bool {
        let Some(subscribers) = self.rooms.get(room_id) else {
            return false;
        };
        subscribers
            .iter()
            .find(|s| &s.peer_id == peer_id)
            .is_some_and(|s| deliver(&s.sink, peer_id, ServerMessage::Notification(event)))
    }

    #[must_use]
    pub fn members(&self, room_id: &RoomId) -> Vec<PeerId> {
        self.rooms
            .get(room_id)
            .map(|subs| subs.iter().map(|s| s.peer_id.clone()).collect())
            .unwrap_or_default()
    }
}
