//! Room state
//!
//! A room owns one engine router plus the maps of every transport, producer
//! and consumer negotiated in it. All maps sit behind a single
//! `parking_lot::Mutex` that is never held across an `.await`: callers do
//! engine work first, then lock, re-check, and register.

use crate::engine::{EngineConsumer, EngineProducer, EngineRouter, EngineTransport};
use crate::protocol::{PeerSummary, ProducerInfo};
use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

pub struct TransportEntry {
    pub handle: Arc<dyn EngineTransport>,
    pub created_at: Instant,
    pub connected: bool,
}

impl TransportEntry {
    #[must_use]
    pub fn new(handle: Arc<dyn EngineTransport>) -> Self {
        Self {
            handle,
            created_at: Instant::now(),
            connected: false,
        }
    }
}

/// A peer's transports: at most one per direction
#[derive(Default)]
pub struct PeerTransports {
    pub producer: Option<TransportEntry>,
    pub consumer: Option<TransportEntry>,
}

impl PeerTransports {
    #[must_use]
    pub const fn get(&self, direction: Direction) -> Option<&TransportEntry> {
        match direction {
            Direction::Producer => self.producer.as_ref(),
            Direction::Consumer => self.consumer.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, direction: Direction) -> &mut Option<TransportEntry> {
        match direction {
            Direction::Producer => &mut self.producer,
            Direction::Consumer => &mut self.consumer,
        }
    }

    fn count(&self) -> usize {
        usize::from(self.producer.is_some()) + usize::from(self.consumer.is_some())
    }

    fn into_handles(self) -> Vec<Arc<dyn EngineTransport>> {
        [self.producer, self.consumer]
            .into_iter()
            .flatten()
            .map(|entry| entry.handle)
            .collect()
    }
}

#[derive(Clone)]
pub struct ProducerEntry {
    pub handle: Arc<dyn EngineProducer>,
    pub owner: PeerId,
    pub kind: MediaKind,
    pub app_data: Value,
}

#[derive(Clone)]
pub struct ConsumerEntry {
    pub handle: Arc<dyn EngineConsumer>,
    pub owner: PeerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub display_name: Option<String>,
    pub joined_at: Instant,
}

/// Everything taken out of a room when a peer departs. Engine handles are
/// released by the caller after the room lock is dropped.
#[derive(Default)]
pub struct Departure {
    pub was_member: bool,
    pub transports: Vec<Arc<dyn EngineTransport>>,
    pub producers: Vec<(ProducerId, ProducerEntry)>,
    pub consumers: Vec<(ConsumerId, ConsumerEntry)>,
    /// Other peers' consumers of the departed producers
    pub cascaded: Vec<(ConsumerId, ConsumerEntry)>,
}

impl Departure {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.was_member
            && self.transports.is_empty()
            && self.producers.is_empty()
            && self.consumers.is_empty()
    }
}

/// Mutable maps of a room
#[derive(Default)]
pub struct RoomState {
    pub members: HashMap<PeerId, Member>,
    pub transports: HashMap<PeerId, PeerTransports>,
    pub producers: HashMap<ProducerId, ProducerEntry>,
    pub consumers: HashMap<ConsumerId, ConsumerEntry>,
    /// Set once the room is being destroyed; nothing may be registered after
    pub closed: bool,
}

impl RoomState {
    #[must_use]
    pub fn is_member(&self, peer_id: &PeerId) -> bool {
        !self.closed && self.members.contains_key(peer_id)
    }

    /// A room with neither peers nor producers must be destroyed
    #[must_use]
    pub fn is_garbage(&self) -> bool {
        self.members.is_empty() && self.producers.is_empty()
    }

    pub fn add_member(&mut self, peer_id: PeerId, display_name: Option<String>) {
        self.members.insert(
            peer_id,
            Member {
                display_name,
                joined_at: Instant::now(),
            },
        );
    }

    #[must_use]
    pub fn transport(&self, peer_id: &PeerId, direction: Direction) -> Option<&TransportEntry> {
        self.transports.get(peer_id)?.get(direction)
    }

    /// Remove a producer and every consumer reading from it
    pub fn remove_producer(
        &mut self,
        producer_id: &ProducerId,
    ) -> Option<(ProducerEntry, Vec<(ConsumerId, ConsumerEntry)>)> {
        let entry = self.producers.remove(producer_id)?;
        let consumer_ids: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| &c.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        let cascaded = consumer_ids
            .into_iter()
            .filter_map(|id| self.consumers.remove(&id).map(|c| (id, c)))
            .collect();
        Some((entry, cascaded))
    }

    /// Take a peer and everything it owns out of the room in one step
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Departure {
        let mut departure = Departure {
            was_member: self.members.remove(peer_id).is_some(),
            ..Departure::default()
        };
        if let Some(transports) = self.transports.remove(peer_id) {
            departure.transports = transports.into_handles();
        }

        let owned_producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.owner == peer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in owned_producers {
            if let Some((entry, cascaded)) = self.remove_producer(&producer_id) {
                departure.producers.push((producer_id, entry));
                for (consumer_id, consumer) in cascaded {
                    // the departing peer's own consumers are released without notice
                    if &consumer.owner == peer_id {
                        departure.consumers.push((consumer_id, consumer));
                    } else {
                        departure.cascaded.push((consumer_id, consumer));
                    }
                }
            }
        }

        let owned_consumers: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| &c.owner == peer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in owned_consumers {
            if let Some(consumer) = self.consumers.remove(&consumer_id) {
                departure.consumers.push((consumer_id, consumer));
            }
        }
        departure
    }

    /// Producers in the room, minus the ones `peer_id` owns
    #[must_use]
    pub fn producers_excluding(&self, peer_id: &PeerId) -> Vec<ProducerInfo> {
        self.producers
            .iter()
            .filter(|(_, p)| &p.owner != peer_id)
            .map(|(id, p)| ProducerInfo {
                producer_id: id.clone(),
                peer_id: p.owner.clone(),
                kind: p.kind,
                app_data: p.app_data.clone(),
            })
            .collect()
    }

    /// Members ordered by join time
    #[must_use]
    pub fn peer_summaries(&self) -> Vec<PeerSummary> {
        let mut members: Vec<(&PeerId, &Member)> = self.members.iter().collect();
        members.sort_by_key(|(_, m)| m.joined_at);
        members
            .into_iter()
            .map(|(peer_id, m)| PeerSummary {
                peer_id: peer_id.clone(),
                display_name: m.display_name.clone(),
            })
            .collect()
    }
}

/// Point-in-time counts for one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStats {
    pub room_id: RoomId,
    pub peer_count: usize,
    pub transport_count: usize,
    pub producer_count: usize,
    pub consumer_count: usize,
    pub audio_producers: usize,
    pub video_producers: usize,
    pub age_secs: u64,
}

pub struct Room {
    pub id: RoomId,
    pub router: Arc<dyn EngineRouter>,
    pub created_at: Instant,
    state: Mutex<RoomState>,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId, router: Arc<dyn EngineRouter>) -> Self {
        Self {
            id,
            router,
            created_at: Instant::now(),
            state: Mutex::new(RoomState::default()),
        }
    }

    /// Lock the room maps. Never hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock()
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let state = self.lock();
        let audio_producers = state
            .producers
            .values()
            .filter(|p| p.kind == MediaKind::Audio)
            .count();
        RoomStats {
            room_id: self.id.clone(),
            peer_count: state.members.len(),
            transport_count: state.transports.values().map(PeerTransports::count).sum(),
            producer_count: state.producers.len(),
            consumer_count: state.consumers.len(),
            audio_producers,
            video_producers: state.producers.len() - audio_producers,
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::{LoopbackConfig, LoopbackEngine};
    use crate::engine::{MediaEngine, TransportOptions};
    use serde_json::json;

    struct Fixture {
        room: Room,
        send: Arc<dyn EngineTransport>,
        recv: Arc<dyn EngineTransport>,
    }

    async fn fixture() -> Fixture {
        let engine = LoopbackEngine::started(LoopbackConfig::default()).unwrap();
        let router = engine.create_router().await.unwrap();
        let send = router
            .create_transport(TransportOptions::new(Direction::Producer))
            .await
            .unwrap();
        let recv = router
            .create_transport(TransportOptions::new(Direction::Consumer))
            .await
            .unwrap();
        Fixture {
            room: Room::new(RoomId::from("r1"), router),
            send,
            recv,
        }
    }

    async fn add_producer(f: &Fixture, owner: &str) -> ProducerId {
        let rtp = json!({ "codecs": [{ "mimeType": "audio/opus" }] });
        let handle = f.send.produce(MediaKind::Audio, rtp, Value::Null).await.unwrap();
        let id = handle.id().clone();
        f.room.lock().producers.insert(
            id.clone(),
            ProducerEntry {
                handle,
                owner: PeerId::from(owner),
                kind: MediaKind::Audio,
                app_data: Value::Null,
            },
        );
        id
    }

    async fn add_consumer(f: &Fixture, owner: &str, producer_id: &ProducerId) -> ConsumerId {
        let caps = json!({ "codecs": [{ "mimeType": "audio/opus" }] });
        let handle = f.recv.consume(producer_id, caps, true).await.unwrap();
        let id = handle.id().clone();
        f.room.lock().consumers.insert(
            id.clone(),
            ConsumerEntry {
                handle,
                owner: PeerId::from(owner),
                producer_id: producer_id.clone(),
                kind: MediaKind::Audio,
                paused: true,
            },
        );
        id
    }

    #[tokio::test]
    async fn test_remove_peer_takes_owned_resources() {
        let f = fixture().await;
        let (a, b) = (PeerId::from("a"), PeerId::from("b"));
        {
            let mut state = f.room.lock();
            state.add_member(a.clone(), None);
            state.add_member(b.clone(), None);
            state.transports.entry(a.clone()).or_default().producer =
                Some(TransportEntry::new(Arc::clone(&f.send)));
        }
        let a_producer = add_producer(&f, "a").await;
        let b_producer = add_producer(&f, "b").await;
        let b_views_a = add_consumer(&f, "b", &a_producer).await;
        let a_views_b = add_consumer(&f, "a", &b_producer).await;

        let departure = f.room.lock().remove_peer(&a);
        assert!(departure.was_member);
        assert_eq!(departure.transports.len(), 1);
        assert_eq!(departure.producers.len(), 1);
        assert_eq!(departure.producers[0].0, a_producer);
        assert_eq!(departure.consumers.len(), 1);
        assert_eq!(departure.consumers[0].0, a_views_b);
        assert_eq!(departure.cascaded.len(), 1);
        assert_eq!(departure.cascaded[0].0, b_views_a);

        let state = f.room.lock();
        assert!(!state.members.contains_key(&a));
        assert!(state.producers.values().all(|p| p.owner != a));
        assert!(state.consumers.is_empty());
        assert!(!state.is_garbage());
    }

    #[tokio::test]
    async fn test_existing_producers_exclude_caller() {
        let f = fixture().await;
        add_producer(&f, "a").await;
        let b_producer = add_producer(&f, "b").await;

        let listed = f.room.lock().producers_excluding(&PeerId::from("a"));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].producer_id, b_producer);
        assert_eq!(f.room.stats().audio_producers, 2);
    }

    #[tokio::test]
    async fn test_stats_count_room_contents() {
        let f = fixture().await;
        f.room.lock().add_member(PeerId::from("a"), None);
        f.room.lock().transports.entry(PeerId::from("a")).or_default().consumer =
            Some(TransportEntry::new(Arc::clone(&f.recv)));
        let producer = add_producer(&f, "b").await;
        add_consumer(&f, "a", &producer).await;

        let stats = f.room.stats();
        assert_eq!(stats.room_id, RoomId::from("r1"));
        assert_eq!(stats.peer_count, 1);
        assert_eq!(stats.transport_count, 1);
        assert_eq!(stats.producer_count, 1);
        assert_eq!(stats.consumer_count, 1);
        assert_eq!(stats.video_producers, 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["room_id"], "r1");
        assert_eq!(json["peer_count"], 1);
    }

    #[tokio::test]
    async fn test_garbage_requires_no_peers_and_no_producers() {
        let f = fixture().await;
        assert!(f.room.lock().is_garbage());
        f.room.lock().add_member(PeerId::from("a"), Some("Ann".into()));
        assert!(!f.room.lock().is_garbage());
        assert_eq!(
            f.room.lock().peer_summaries(),
            vec![PeerSummary {
                peer_id: PeerId::from("a"),
                display_name: Some("Ann".into())
            }]
        );

        let departure = f.room.lock().remove_peer(&PeerId::from("a"));
        assert!(departure.was_member);
        assert!(f.room.lock().is_garbage());
        assert!(f.room.lock().remove_peer(&PeerId::from("a")).is_empty());
    }
}
