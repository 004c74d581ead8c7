//! Per-connection peer sessions
//!
//! One session per signaling connection, keyed by the server-assigned
//! [`PeerId`]. A session tracks which room it is in (at most one) and walks
//! `Unjoined → Joining → Joined → Left`. Cleanup looks the room up here
//! instead of scanning every room.

use crate::error::{Result, SignalError};
use crate::protocol::OutboundSink;
use crate::types::{PeerId, RoomId};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Join state of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    Unjoined,
    Joining(RoomId),
    Joined(RoomId),
    /// Disconnected; cleanup has been claimed
    Left,
}

impl JoinState {
    /// Room the connection is in or entering
    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::Joining(room_id) | Self::Joined(room_id) => Some(room_id),
            Self::Unjoined | Self::Left => None,
        }
    }
}

/// Result of starting a join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStart {
    /// The session moved to `Joining` and the caller must finish the join
    Proceed,
    /// Already a member of that room; nothing to do
    AlreadyJoined,
}

#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer_id: PeerId,
    pub display_name: Option<String>,
    pub state: JoinState,
    pub sink: OutboundSink,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub message_count: u64,
}

impl PeerSession {
    fn new(peer_id: PeerId, sink: OutboundSink) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            display_name: None,
            state: JoinState::Unjoined,
            sink,
            connected_at: now,
            last_activity: now,
            message_count: 0,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    #[must_use]
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionMetrics {
    pub active_sessions: usize,
    pub joined_sessions: usize,
    pub total_connections: u64,
    pub total_messages: u64,
}

/// Registry of live signaling sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<PeerId, PeerSession>,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and assign its peer id
    pub fn register(&self, sink: OutboundSink) -> PeerId {
        let peer_id = PeerId::generate();
        self.sessions
            .insert(peer_id.clone(), PeerSession::new(peer_id.clone(), sink));
        let total = self.total_connections.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            peer_id = %peer_id,
            active = self.sessions.len(),
            total_connections = total,
            "Peer session registered"
        );
        peer_id
    }

    /// Drop a session once its cleanup is done
    pub fn unregister(&self, peer_id: &PeerId) {
        if let Some((_, session)) = self.sessions.remove(peer_id) {
            info!(
                peer_id = %peer_id,
                duration_secs = session.duration().as_secs(),
                messages = session.message_count,
                "Peer session unregistered"
            );
        }
    }

    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<PeerSession> {
        self.sessions.get(peer_id).map(|s| s.clone())
    }

    /// Outbound queue of a live session. `None` once the connection is
    /// marked left, so requests still queued behind a disconnect are dropped.
    #[must_use]
    pub fn sink(&self, peer_id: &PeerId) -> Option<OutboundSink> {
        self.sessions
            .get(peer_id)
            .filter(|s| s.state != JoinState::Left)
            .map(|s| s.sink.clone())
    }

    pub fn record_message(&self, peer_id: &PeerId) {
        if let Some(mut session) = self.sessions.get_mut(peer_id) {
            session.last_activity = Instant::now();
            session.message_count += 1;
            self.total_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Claim the session for joining `room_id`
    pub fn begin_join(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<JoinStart> {
        let mut session = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::NotInRoom(room_id.clone()))?;
        match &session.state {
            JoinState::Unjoined => {
                session.state = JoinState::Joining(room_id.clone());
                Ok(JoinStart::Proceed)
            }
            JoinState::Joined(current) if current == room_id => Ok(JoinStart::AlreadyJoined),
            JoinState::Joined(current) | JoinState::Joining(current) => {
                Err(SignalError::AlreadyInRoom(current.clone()))
            }
            JoinState::Left => Err(SignalError::NotInRoom(room_id.clone())),
        }
    }

    /// Finish a join. Returns false when the connection went away meanwhile,
    /// in which case the caller must undo the room membership.
    pub fn complete_join(
        &self,
        peer_id: &PeerId,
        room_id: &RoomId,
        display_name: Option<String>,
    ) -> bool {
        let Some(mut session) = self.sessions.get_mut(peer_id) else {
            return false;
        };
        if session.state != JoinState::Joining(room_id.clone()) {
            return false;
        }
        session.state = JoinState::Joined(room_id.clone());
        session.display_name = display_name;
        debug!(peer_id = %peer_id, room_id = %room_id, "Peer session joined");
        true
    }

    /// Return a failed join to `Unjoined`
    pub fn abort_join(&self, peer_id: &PeerId, room_id: &RoomId) {
        if let Some(mut session) = self.sessions.get_mut(peer_id) {
            if session.state == JoinState::Joining(room_id.clone()) {
                session.state = JoinState::Unjoined;
            }
        }
    }

    /// Fail with `NotInRoom` unless the session is joined to `room_id`
    pub fn require_joined(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<()> {
        match self.sessions.get(peer_id).map(|s| s.state.clone()) {
            Some(JoinState::Joined(current)) if &current == room_id => Ok(()),
            _ => Err(SignalError::NotInRoom(room_id.clone())),
        }
    }

    /// Voluntary leave: `Joined(room_id) → Unjoined`
    pub fn leave(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::NotInRoom(room_id.clone()))?;
        if session.state != JoinState::Joined(room_id.clone()) {
            return Err(SignalError::NotInRoom(room_id.clone()));
        }
        session.state = JoinState::Unjoined;
        Ok(())
    }

    /// Mark a connection as gone. Returns the state it was in, or `None`
    /// when it was already marked (or never registered).
    pub fn mark_left(&self, peer_id: &PeerId) -> Option<JoinState> {
        let mut session = self.sessions.get_mut(peer_id)?;
        if session.state == JoinState::Left {
            return None;
        }
        Some(std::mem::replace(&mut session.state, JoinState::Left))
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            active_sessions: self.sessions.len(),
            joined_sessions: self
                .sessions
                .iter()
                .filter(|s| matches!(s.state, JoinState::Joined(_)))
                .count(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
        }
    }
}
