//! Disconnect and cleanup coordination
//!
//! Every teardown path ends up here: a connection closing, a voluntary
//! leave, a peer closing one of its producers, the media engine ending a
//! producer on its own, and the periodic sweep of idle transports and rooms.
//!
//! Room maps are updated and notifications queued in one locked step, so
//! other peers see `producerClosed` before the engine resource is released
//! and never observe a half-removed peer. Engine handles are closed after
//! the lock is dropped.

use crate::config::SfuConfig;
use crate::engine::{EngineConsumer, EngineProducer, EngineTransport};
use crate::error::{Result, SignalError};
use crate::hub::BroadcastHub;
use crate::protocol::Event;
use crate::registry::RoomRegistry;
use crate::room::{ConsumerEntry, Departure, ProducerEntry};
use crate::session::SessionRegistry;
use crate::types::{ConsumerId, Direction, PeerId, ProducerId, RoomId};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Who is closing a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerCloseReason {
    /// The owning peer asked for it; everyone else is notified
    Owner(PeerId),
    /// The engine ended it; the owner is notified as well
    Engine,
}

/// Work done by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub transports_closed: usize,
    pub rooms_reaped: usize,
}

pub struct CleanupCoordinator {
    config: Arc<SfuConfig>,
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionRegistry>,
}

impl CleanupCoordinator {
    #[must_use]
    pub fn new(
        config: Arc<SfuConfig>,
        registry: Arc<RoomRegistry>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            registry,
            sessions,
        }
    }

    fn hub(&self) -> &BroadcastHub {
        self.registry.hub()
    }

    /// Tear down everything a connection owns and drop its session.
    ///
    /// Runs once per connection; later calls return `false` and do nothing.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        let Some(previous) = self.sessions.mark_left(peer_id) else {
            debug!(peer_id = %peer_id, "Disconnect already handled");
            return false;
        };
        if let Some(room_id) = previous.room_id() {
            self.depart(room_id, peer_id).await;
        }
        self.sessions.unregister(peer_id);
        info!(peer_id = %peer_id, "Peer disconnected");
        true
    }

    /// Leave a room but keep the connection
    pub async fn leave(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<()> {
        self.sessions.leave(peer_id, room_id)?;
        self.depart(room_id, peer_id).await;
        info!(room_id = %room_id, peer_id = %peer_id, "Peer left room");
        Ok(())
    }

    /// Remove a peer and its transports, producers and consumers from a
    /// room, notify the rest of the room, and destroy the room if nothing
    /// is left in it.
    pub async fn depart(&self, room_id: &RoomId, peer_id: &PeerId) {
        let Ok(room) = self.registry.get_room(room_id) else {
            debug!(room_id = %room_id, peer_id = %peer_id, "Room already gone");
            return;
        };

        let (departure, destroy) = {
            let mut state = room.lock();
            let departure = state.remove_peer(peer_id);
            self.hub().unsubscribe(room_id, peer_id);

            for (producer_id, entry) in &departure.producers {
                self.announce_producer_closed(room_id, Some(peer_id), producer_id, entry);
            }
            self.announce_consumers_closed(room_id, &departure.cascaded);
            if departure.was_member {
                self.hub().broadcast(
                    room_id,
                    Some(peer_id),
                    &Event::PeerLeft {
                        room_id: room_id.clone(),
                        peer_id: peer_id.clone(),
                    },
                );
            }

            let destroy = !departure.is_empty() && !state.closed && state.is_garbage();
            if destroy {
                state.closed = true;
            }
            (departure, destroy)
        };

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            transports = departure.transports.len(),
            producers = departure.producers.len(),
            consumers = departure.consumers.len(),
            cascaded_consumers = departure.cascaded.len(),
            "Released peer resources"
        );
        release(departure).await;

        if destroy {
            self.registry.destroy_room(room_id).await;
        }
    }

    /// Close one producer: remove it and its consumers, notify the room and
    /// each affected viewer, then release engine resources.
    pub async fn close_producer(
        &self,
        room_id: &RoomId,
        producer_id: &ProducerId,
        reason: ProducerCloseReason,
    ) -> Result<()> {
        let room = self.registry.get_room(room_id)?;

        let (entry, cascaded, destroy) = {
            let mut state = room.lock();
            let owned = match (&reason, state.producers.get(producer_id)) {
                (_, None) => false,
                (ProducerCloseReason::Owner(peer_id), Some(entry)) => &entry.owner == peer_id,
                (ProducerCloseReason::Engine, Some(_)) => true,
            };
            if !owned {
                return Err(SignalError::ProducerNotFound(producer_id.clone()));
            }
            let Some((entry, cascaded)) = state.remove_producer(producer_id) else {
                return Err(SignalError::ProducerNotFound(producer_id.clone()));
            };

            let exclude = match &reason {
                ProducerCloseReason::Owner(peer_id) => Some(peer_id),
                ProducerCloseReason::Engine => None,
            };
            self.announce_producer_closed(room_id, exclude, producer_id, &entry);
            self.announce_consumers_closed(room_id, &cascaded);

            let destroy = !state.closed && state.is_garbage();
            if destroy {
                state.closed = true;
            }
            (entry, cascaded, destroy)
        };

        info!(
            room_id = %room_id,
            producer_id = %producer_id,
            owner = %entry.owner,
            reason = ?reason,
            cascaded_consumers = cascaded.len(),
            "Producer closed"
        );
        entry.handle.close().await;
        close_consumers(cascaded.into_iter().map(|(_, c)| c.handle)).await;

        if destroy {
            self.registry.destroy_room(room_id).await;
        }
        Ok(())
    }

    /// Funnel an engine-side producer end into [`Self::close_producer`].
    /// A producer already removed by its owner or a departure is ignored.
    pub fn watch_producer(self: &Arc<Self>, room_id: RoomId, producer: Arc<dyn EngineProducer>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            producer.ended().await;
            let producer_id = producer.id().clone();
            drop(producer);
            if coordinator
                .close_producer(&room_id, &producer_id, ProducerCloseReason::Engine)
                .await
                .is_err()
            {
                debug!(room_id = %room_id, producer_id = %producer_id, "Ended producer was already removed");
            }
        });
    }

    fn announce_producer_closed(
        &self,
        room_id: &RoomId,
        exclude: Option<&PeerId>,
        producer_id: &ProducerId,
        entry: &ProducerEntry,
    ) {
        self.hub().broadcast(
            room_id,
            exclude,
            &Event::ProducerClosed {
                room_id: room_id.clone(),
                producer_id: producer_id.clone(),
                app_data: entry.app_data.clone(),
            },
        );
    }

    fn announce_consumers_closed(&self, room_id: &RoomId, consumers: &[(ConsumerId, ConsumerEntry)]) {
        for (consumer_id, consumer) in consumers {
            self.hub().send_to(
                room_id,
                &consumer.owner,
                Event::ConsumerClosed {
                    room_id: room_id.clone(),
                    consumer_id: consumer_id.clone(),
                    producer_id: consumer.producer_id.clone(),
                },
            );
        }
    }

    /// Close transports that were never connected within the idle timeout,
    /// then reap rooms that have been empty for longer than the grace period.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        if let Some(timeout) = self.config.transport_idle_timeout() {
            for room in self.registry.rooms_snapshot() {
                let mut transports: Vec<Arc<dyn EngineTransport>> = Vec::new();
                let mut consumers: Vec<Arc<dyn EngineConsumer>> = Vec::new();
                {
                    let mut guard = room.lock();
                    let state = &mut *guard;
                    if state.closed {
                        continue;
                    }
                    for (peer_id, peer_transports) in &mut state.transports {
                        for direction in [Direction::Producer, Direction::Consumer] {
                            let slot = peer_transports.slot_mut(direction);
                            let expired = slot
                                .as_ref()
                                .is_some_and(|t| !t.connected && t.created_at.elapsed() >= timeout);
                            if !expired {
                                continue;
                            }
                            let Some(entry) = slot.take() else { continue };

                            if direction == Direction::Consumer {
                                let owned: Vec<ConsumerId> = state
                                    .consumers
                                    .iter()
                                    .filter(|(_, c)| &c.owner == peer_id)
                                    .map(|(id, _)| id.clone())
                                    .collect();
                                let removed: Vec<(ConsumerId, ConsumerEntry)> = owned
                                    .into_iter()
                                    .filter_map(|id| state.consumers.remove(&id).map(|c| (id, c)))
                                    .collect();
                                self.announce_consumers_closed(&room.id, &removed);
                                consumers.extend(removed.into_iter().map(|(_, c)| c.handle));
                            }

                            self.hub().send_to(
                                &room.id,
                                peer_id,
                                Event::TransportClosed {
                                    room_id: room.id.clone(),
                                    transport_id: entry.handle.id().clone(),
                                    direction,
                                },
                            );
                            info!(
                                room_id = %room.id,
                                peer_id = %peer_id,
                                transport_id = %entry.handle.id(),
                                direction = %direction,
                                "Closing transport that was never connected"
                            );
                            transports.push(entry.handle);
                        }
                    }
                    state
                        .transports
                        .retain(|_, t| t.producer.is_some() || t.consumer.is_some());
                }

                report.transports_closed += transports.len();
                for transport in transports {
                    transport.close().await;
                }
                close_consumers(consumers).await;
            }
        }

        report.rooms_reaped = self
            .registry
            .reap_idle_rooms(self.config.empty_room_grace())
            .await;
        report
    }

    /// Sweep on an interval until cancelled. Returns at once when the
    /// sweep interval is 0.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let Some(period) = self.config.sweep_interval() else {
            info!("Background cleanup sweep disabled");
            return;
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "Starting cleanup sweeper");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report != SweepReport::default() {
                        debug!(
                            transports_closed = report.transports_closed,
                            rooms_reaped = report.rooms_reaped,
                            "Sweep complete"
                        );
                    }
                }
            }
        }
        info!("Cleanup sweeper stopped");
    }
}

async fn close_consumers(consumers: impl IntoIterator<Item = Arc<dyn EngineConsumer>>) {
    for consumer in consumers {
        consumer.close().await;
    }
}

/// Release engine resources taken out of a room: transports, then
/// producers, then consumers
async fn release(departure: Departure) {
    for transport in departure.transports {
        transport.close().await;
    }
    for (_, producer) in departure.producers {
        producer.handle.close().await;
    }
    close_consumers(
        departure
            .consumers
            .into_iter()
            .chain(departure.cascaded)
            .map(|(_, c)| c.handle),
    )
    .await;
}
