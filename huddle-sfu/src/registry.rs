//! Room registry
//!
//! Owns `RoomId → Room`. Rooms are only created by an explicit request and
//! only destroyed through [`RoomRegistry::destroy_room`], which the cleanup
//! coordinator calls once a room holds neither peers nor producers.

use crate::config::SfuConfig;
use crate::engine::MediaEngine;
use crate::error::{Result, SignalError};
use crate::hub::BroadcastHub;
use crate::protocol::{Event, JoinedRoom, OutboundSink};
use crate::room::{Room, RoomStats};
use crate::types::{PeerId, RoomId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Aggregate counts across all rooms
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub pending_rooms: usize,
    pub total_peers: usize,
    pub total_transports: usize,
    pub total_producers: usize,
    pub total_consumers: usize,
}

/// Holds a room id while its router is being created. Dropping it releases
/// the id, including when the creating future is cancelled.
struct Reservation<'a> {
    pending: &'a DashMap<RoomId, ()>,
    room_id: RoomId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.room_id);
    }
}

pub struct RoomRegistry {
    config: Arc<SfuConfig>,
    engine: Arc<dyn MediaEngine>,
    hub: Arc<BroadcastHub>,
    rooms: DashMap<RoomId, Arc<Room>>,
    pending: DashMap<RoomId, ()>,
    /// Serializes the room-limit check with the reservation it admits
    admission: Mutex<()>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(config: Arc<SfuConfig>, engine: Arc<dyn MediaEngine>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            config,
            engine,
            hub,
            rooms: DashMap::new(),
            pending: DashMap::new(),
            admission: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    fn reserve(&self, room_id: &RoomId) -> Result<Reservation<'_>> {
        let _admission = self.admission.lock();

        let max_rooms = self.config.max_rooms;
        if max_rooms > 0 && self.rooms.len() + self.pending.len() >= max_rooms {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms,
                "Room limit reached"
            );
            return Err(SignalError::RoomLimitReached(max_rooms));
        }

        match self.pending.entry(room_id.clone()) {
            Entry::Occupied(_) => Err(SignalError::RoomAlreadyExists(room_id.clone())),
            Entry::Vacant(slot) => {
                if self.rooms.contains_key(room_id) {
                    return Err(SignalError::RoomAlreadyExists(room_id.clone()));
                }
                slot.insert(());
                Ok(Reservation {
                    pending: &self.pending,
                    room_id: room_id.clone(),
                })
            }
        }
    }

    /// Create a room, under a client-chosen id or a fresh one.
    ///
    /// Check-and-create is atomic per id even though router creation
    /// suspends: a second concurrent create of the same id fails with
    /// `RoomAlreadyExists`.
    pub async fn create_room(&self, requested: Option<RoomId>) -> Result<RoomId> {
        let room_id = match requested {
            Some(room_id) => {
                room_id.validate().map_err(SignalError::InvalidRequest)?;
                room_id
            }
            None => RoomId::generate(),
        };

        let reservation = self.reserve(&room_id)?;
        let router = self.engine.create_router().await.map_err(|e| {
            warn!(room_id = %room_id, error = %e, "Media engine could not create a router");
            SignalError::from(e)
        })?;

        let room = Arc::new(Room::new(room_id.clone(), router));
        self.rooms.insert(room_id.clone(), room);
        drop(reservation);

        info!(
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Created new room"
        );
        Ok(room_id)
    }

    pub fn get_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        self.rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SignalError::RoomNotFound(room_id.clone()))
    }

    /// Close the room's router and forget it. Idempotent.
    pub async fn destroy_room(&self, room_id: &RoomId) -> bool {
        let Some((_, room)) = self.rooms.remove(room_id) else {
            debug!(room_id = %room_id, "Room already destroyed");
            return false;
        };
        room.lock().closed = true;
        self.hub.remove_room(room_id);
        room.router.close().await;
        info!(
            room_id = %room_id,
            remaining_rooms = self.rooms.len(),
            "Destroyed room"
        );
        true
    }

    /// Add a peer to a room and announce it to the other members.
    ///
    /// Joining a room the peer is already in returns the current membership
    /// without side effects.
    pub fn join_room(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        display_name: Option<String>,
        sink: OutboundSink,
    ) -> Result<JoinedRoom> {
        let room = self.get_room(room_id)?;
        let mut state = room.lock();
        if state.closed {
            return Err(SignalError::RoomNotFound(room_id.clone()));
        }
        if !state.members.contains_key(peer_id) {
            let max = self.config.max_peers_per_room;
            if max > 0 && state.members.len() >= max {
                warn!(room_id = %room_id, peer_id = %peer_id, max_peers = max, "Room is full");
                return Err(SignalError::RoomFull {
                    room_id: room_id.clone(),
                    max,
                });
            }
            state.add_member(peer_id.clone(), display_name.clone());
            self.hub.subscribe(room_id, peer_id, sink);
            self.hub.broadcast(
                room_id,
                Some(peer_id),
                &Event::PeerJoined {
                    room_id: room_id.clone(),
                    peer_id: peer_id.clone(),
                    display_name,
                },
            );
            info!(
                room_id = %room_id,
                peer_id = %peer_id,
                peer_count = state.members.len(),
                "Peer joined room"
            );
        }
        Ok(JoinedRoom {
            room_id: room_id.clone(),
            peer_id: peer_id.clone(),
            peers: state.peer_summaries(),
        })
    }

    /// Current member peer ids of a room
    pub fn members(&self, room_id: &RoomId) -> Result<Vec<PeerId>> {
        let room = self.get_room(room_id)?;
        let state = room.lock();
        Ok(state.members.keys().cloned().collect())
    }

    pub fn room_stats(&self, room_id: &RoomId) -> Result<RoomStats> {
        Ok(self.get_room(room_id)?.stats())
    }

    pub(crate) fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        // Collect first so no map shard stays locked while rooms are
        let rooms = self.rooms_snapshot();
        let mut stats = RegistryStats {
            active_rooms: rooms.len(),
            pending_rooms: self.pending.len(),
            ..RegistryStats::default()
        };
        for room in rooms {
            let room_stats = room.stats();
            stats.total_peers += room_stats.peer_count;
            stats.total_transports += room_stats.transport_count;
            stats.total_producers += room_stats.producer_count;
            stats.total_consumers += room_stats.consumer_count;
        }
        stats
    }

    /// Destroy rooms that have stayed without peers and producers for
    /// longer than `grace` (rooms created but never joined)
    pub async fn reap_idle_rooms(&self, grace: Duration) -> usize {
        let mut idle = Vec::new();
        for room in self.rooms_snapshot() {
            let mut state = room.lock();
            if !state.closed && state.is_garbage() && room.created_at.elapsed() >= grace {
                state.closed = true;
                idle.push(room.id.clone());
            }
        }
        let mut removed = 0;
        for room_id in idle {
            if self.destroy_room(&room_id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, remaining_rooms = self.rooms.len(), "Reaped idle rooms");
        }
        removed
    }

    /// Destroy every room
    pub async fn shutdown(&self) {
        let room_ids = self.room_ids();
        info!(rooms = room_ids.len(), "Destroying all rooms");
        for room_id in room_ids {
            self.destroy_room(&room_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::{LoopbackConfig, LoopbackEngine};
    use crate::engine::MockMediaEngine;
    use crate::error::EngineError;
    use tokio::sync::mpsc;

    fn registry_with(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> RoomRegistry {
        RoomRegistry::new(Arc::new(config), engine, Arc::new(BroadcastHub::new()))
    }

    fn loopback_registry(config: SfuConfig) -> RoomRegistry {
        let engine = LoopbackEngine::started(LoopbackConfig::default()).unwrap();
        registry_with(config, Arc::new(engine))
    }

    #[tokio::test]
    async fn test_engine_unavailable_fails_create() {
        let mut engine = MockMediaEngine::new();
        engine
            .expect_create_router()
            .times(1)
            .returning(|| Err(EngineError::Unavailable("workers starting".into())));
        let registry = registry_with(SfuConfig::default(), Arc::new(engine));

        let err = registry.create_room(None).await.unwrap_err();
        assert_eq!(err.kind(), "EngineUnavailable");
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.stats().pending_rooms, 0);
    }

    #[tokio::test]
    async fn test_client_supplied_id_is_unique() {
        let registry = loopback_registry(SfuConfig::default());
        let room_id = RoomId::from("weekly-sync");

        assert_eq!(registry.create_room(Some(room_id.clone())).await.unwrap(), room_id);
        assert_eq!(
            registry.create_room(Some(room_id.clone())).await.unwrap_err(),
            SignalError::RoomAlreadyExists(room_id)
        );
        assert!(matches!(
            registry.create_room(Some(RoomId::from("no spaces"))).await,
            Err(SignalError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_room_limit() {
        let registry = loopback_registry(SfuConfig {
            max_rooms: 2,
            ..SfuConfig::default()
        });
        registry.create_room(None).await.unwrap();
        registry.create_room(None).await.unwrap();
        assert_eq!(
            registry.create_room(None).await.unwrap_err(),
            SignalError::RoomLimitReached(2)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_room_limit_holds_under_concurrent_creates() {
        let registry = Arc::new(loopback_registry(SfuConfig {
            max_rooms: 3,
            ..SfuConfig::default()
        }));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.create_room(None).await })
            })
            .collect();
        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(err) => assert_eq!(err, SignalError::RoomLimitReached(3)),
            }
        }

        assert_eq!(created, 3);
        assert_eq!(registry.room_count(), 3);
        assert_eq!(registry.stats().pending_rooms, 0);
    }

    #[tokio::test]
    async fn test_join_unknown_room_creates_nothing() {
        let registry = loopback_registry(SfuConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let err = registry
            .join_room(&RoomId::from("nonexistent-room"), &PeerId::from("a"), None, tx)
            .unwrap_err();
        assert_eq!(err, SignalError::RoomNotFound(RoomId::from("nonexistent-room")));
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_limit_and_duplicate_join() {
        let registry = loopback_registry(SfuConfig {
            max_peers_per_room: 1,
            ..SfuConfig::default()
        });
        let room_id = registry.create_room(None).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);

        let first = registry
            .join_room(&room_id, &PeerId::from("a"), None, tx.clone())
            .unwrap();
        let again = registry
            .join_room(&room_id, &PeerId::from("a"), None, tx.clone())
            .unwrap();
        assert_eq!(first, again);
        assert!(matches!(
            registry.join_room(&room_id, &PeerId::from("b"), None, tx),
            Err(SignalError::RoomFull { max: 1, .. })
        ));
        assert_eq!(registry.members(&room_id).unwrap(), vec![PeerId::from("a")]);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let registry = loopback_registry(SfuConfig::default());
        let room_id = registry.create_room(None).await.unwrap();
        let room = registry.get_room(&room_id).unwrap();

        assert!(registry.destroy_room(&room_id).await);
        assert!(!registry.destroy_room(&room_id).await);
        assert!(room.lock().closed);
        assert!(matches!(
            registry.get_room(&room_id),
            Err(SignalError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reap_idle_rooms_respects_grace() {
        let registry = loopback_registry(SfuConfig::default());
        registry.create_room(None).await.unwrap();
        assert_eq!(registry.reap_idle_rooms(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.reap_idle_rooms(Duration::ZERO).await, 1);
        assert_eq!(registry.room_count(), 0);
    }
}
