//! Signaling request handler
//!
//! Dispatches one peer's requests against the room registry and the media
//! engine and writes the response to the peer's outbound queue. Engine calls
//! run without any room lock held; their results are registered only if the
//! peer is still in the room when they complete, otherwise they are closed
//! and the caller gets `NotInRoom`.
//!
//! `getExistingProducers` and `consume` push their response while the room is
//! locked, using a queue slot reserved beforehand. Any `newProducer` for a
//! producer registered later is queued behind that response.

use crate::cleanup::{CleanupCoordinator, ProducerCloseReason};
use crate::engine::{EngineTransport, TransportOptions};
use crate::error::{Result, SignalError};
use crate::protocol::{
    ClientRequest, ConsumerInfo, Event, OutboundSink, Request, ResponseBody, ServerMessage,
    TransportCreated,
};
use crate::registry::RoomRegistry;
use crate::room::{ConsumerEntry, ProducerEntry, Room, TransportEntry};
use crate::session::{JoinStart, SessionRegistry};
use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, TransportId};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a request's response reaches the peer
enum Reply {
    /// Send this body once the handler returns
    Body(ResponseBody),
    /// Already queued in order by the handler
    Sent,
}

pub struct SignalingHandler {
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionRegistry>,
    cleanup: Arc<CleanupCoordinator>,
}

impl SignalingHandler {
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        sessions: Arc<SessionRegistry>,
        cleanup: Arc<CleanupCoordinator>,
    ) -> Self {
        Self {
            registry,
            sessions,
            cleanup,
        }
    }

    /// Parse a text frame and handle it. Malformed frames get an
    /// `InvalidRequest` response.
    pub async fn handle_text(&self, peer_id: &PeerId, text: &str) {
        match ClientRequest::parse(text) {
            Ok(request) => self.handle(peer_id, request).await,
            Err(response) => {
                debug!(peer_id = %peer_id, "Rejected malformed signaling frame");
                if let Some(sink) = self.sessions.sink(peer_id) {
                    // the connection may already be gone
                    let _ = sink.send(response).await;
                }
            }
        }
    }

    /// Handle one request and deliver its response
    pub async fn handle(&self, peer_id: &PeerId, request: ClientRequest) {
        let Some(sink) = self.sessions.sink(peer_id) else {
            debug!(peer_id = %peer_id, "Request from unknown session ignored");
            return;
        };
        self.sessions.record_message(peer_id);

        let ClientRequest { id, request } = request;
        let method = request.method();
        debug!(peer_id = %peer_id, request_id = id, method, "Handling signaling request");

        let result = match self.dispatch(peer_id, id, request, &sink).await {
            Ok(Reply::Sent) => return,
            Ok(Reply::Body(body)) => Ok(body),
            Err(err) => {
                debug!(
                    peer_id = %peer_id,
                    request_id = id,
                    method,
                    error = %err,
                    "Signaling request failed"
                );
                Err(err)
            }
        };
        if sink.send(ServerMessage::response(id, result)).await.is_err() {
            debug!(peer_id = %peer_id, request_id = id, "Connection closed before response");
        }
    }

    async fn dispatch(
        &self,
        peer_id: &PeerId,
        id: u64,
        request: Request,
        sink: &OutboundSink,
    ) -> Result<Reply> {
        match request {
            Request::CreateRoom { room_id } => {
                let room_id = self.registry.create_room(room_id).await?;
                Ok(Reply::Body(ResponseBody::RoomCreated { room_id }))
            }
            Request::JoinRoom {
                room_id,
                display_name,
            } => self.join_room(peer_id, room_id, display_name, sink).await,
            Request::LeaveRoom { room_id } => {
                self.cleanup.leave(&room_id, peer_id).await?;
                Ok(Reply::Body(ResponseBody::Ack {}))
            }
            Request::GetRtpCapabilities { room_id } => {
                let room = self.joined_room(peer_id, &room_id)?;
                Ok(Reply::Body(ResponseBody::RtpCapabilities {
                    rtp_capabilities: room.router.rtp_capabilities(),
                }))
            }
            Request::CreateTransport { room_id, direction } => {
                self.create_transport(peer_id, room_id, direction).await
            }
            Request::ConnectTransport {
                room_id,
                direction,
                transport_id,
                dtls_parameters,
            } => {
                self.connect_transport(peer_id, room_id, direction, transport_id, dtls_parameters)
                    .await
            }
            Request::Produce {
                room_id,
                kind,
                rtp_parameters,
                app_data,
            } => self.produce(peer_id, room_id, kind, rtp_parameters, app_data).await,
            Request::GetExistingProducers { room_id } => {
                self.get_existing_producers(peer_id, id, room_id, sink).await
            }
            Request::Consume {
                room_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.consume(peer_id, id, room_id, producer_id, rtp_capabilities, sink)
                    .await
            }
            Request::ResumeConsumer {
                room_id,
                consumer_id,
            } => self.set_consumer_paused(peer_id, room_id, consumer_id, false).await,
            Request::PauseConsumer {
                room_id,
                consumer_id,
            } => self.set_consumer_paused(peer_id, room_id, consumer_id, true).await,
            Request::CloseProducer {
                room_id,
                producer_id,
            } => {
                self.sessions.require_joined(peer_id, &room_id)?;
                self.cleanup
                    .close_producer(
                        &room_id,
                        &producer_id,
                        ProducerCloseReason::Owner(peer_id.clone()),
                    )
                    .await?;
                Ok(Reply::Body(ResponseBody::Ack {}))
            }
        }
    }

    /// The room, provided the peer is joined to it
    fn joined_room(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<Arc<Room>> {
        self.sessions.require_joined(peer_id, room_id)?;
        self.registry.get_room(room_id)
    }

    async fn join_room(
        &self,
        peer_id: &PeerId,
        room_id: RoomId,
        display_name: Option<String>,
        sink: &OutboundSink,
    ) -> Result<Reply> {
        if self.sessions.begin_join(peer_id, &room_id)? == JoinStart::AlreadyJoined {
            let joined = self
                .registry
                .join_room(&room_id, peer_id, display_name, sink.clone())?;
            return Ok(Reply::Body(ResponseBody::Joined(joined)));
        }

        let joined = match self
            .registry
            .join_room(&room_id, peer_id, display_name.clone(), sink.clone())
        {
            Ok(joined) => joined,
            Err(err) => {
                self.sessions.abort_join(peer_id, &room_id);
                return Err(err);
            }
        };
        if !self.sessions.complete_join(peer_id, &room_id, display_name) {
            // disconnected while joining: undo the membership
            self.cleanup.depart(&room_id, peer_id).await;
            return Err(SignalError::NotInRoom(room_id));
        }
        Ok(Reply::Body(ResponseBody::Joined(joined)))
    }

    async fn create_transport(
        &self,
        peer_id: &PeerId,
        room_id: RoomId,
        direction: Direction,
    ) -> Result<Reply> {
        let room = self.joined_room(peer_id, &room_id)?;
        if room.lock().transport(peer_id, direction).is_some() {
            return Err(SignalError::TransportAlreadyExists(direction));
        }

        let transport = room
            .router
            .create_transport(TransportOptions::new(direction))
            .await?;

        let registered = {
            let mut state = room.lock();
            if state.is_member(peer_id) {
                let slot = state
                    .transports
                    .entry(peer_id.clone())
                    .or_default()
                    .slot_mut(direction);
                if slot.is_some() {
                    Err(SignalError::TransportAlreadyExists(direction))
                } else {
                    *slot = Some(TransportEntry::new(Arc::clone(&transport)));
                    Ok(())
                }
            } else {
                Err(SignalError::NotInRoom(room_id.clone()))
            }
        };
        if let Err(err) = registered {
            debug!(
                room_id = %room_id,
                peer_id = %peer_id,
                transport_id = %transport.id(),
                "Discarding transport created for a departed peer"
            );
            transport.close().await;
            return Err(err);
        }

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            transport_id = %transport.id(),
            direction = %direction,
            "Transport created"
        );
        Ok(Reply::Body(ResponseBody::TransportCreated(TransportCreated {
            direction,
            params: transport.params(),
        })))
    }

    async fn connect_transport(
        &self,
        peer_id: &PeerId,
        room_id: RoomId,
        direction: Direction,
        transport_id: TransportId,
        dtls_parameters: Value,
    ) -> Result<Reply> {
        let room = self.joined_room(peer_id, &room_id)?;
        let transport = room
            .lock()
            .transport(peer_id, direction)
            .filter(|t| t.handle.id() == &transport_id)
            .map(|t| Arc::clone(&t.handle))
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.to_string()))?;

        transport.connect(dtls_parameters).await?;

        let mut state = room.lock();
        let entry = state
            .transports
            .get_mut(peer_id)
            .and_then(|t| t.slot_mut(direction).as_mut())
            .filter(|t| t.handle.id() == &transport_id);
        match entry {
            Some(entry) => entry.connected = true,
            None => return Err(SignalError::TransportNotFound(transport_id.to_string())),
        }
        drop(state);

        debug!(
            room_id = %room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            "Transport connected"
        );
        Ok(Reply::Body(ResponseBody::Ack {}))
    }

    async fn produce(
        &self,
        peer_id: &PeerId,
        room_id: RoomId,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Reply> {
        let room = self.joined_room(peer_id, &room_id)?;
        let transport: Arc<dyn EngineTransport> = room
            .lock()
            .transport(peer_id, Direction::Producer)
            .filter(|t| t.connected)
            .map(|t| Arc::clone(&t.handle))
            .ok_or_else(|| {
                SignalError::TransportNotFound("no connected producer transport".to_string())
            })?;

        let producer = transport
            .produce(kind, rtp_parameters, app_data.clone())
            .await?;
        let producer_id = producer.id().clone();

        let registered = {
            let mut state = room.lock();
            if state.is_member(peer_id) {
                state.producers.insert(
                    producer_id.clone(),
                    ProducerEntry {
                        handle: Arc::clone(&producer),
                        owner: peer_id.clone(),
                        kind,
                        app_data: app_data.clone(),
                    },
                );
                self.registry.hub().broadcast(
                    &room_id,
                    Some(peer_id),
                    &Event::NewProducer {
                        room_id: room_id.clone(),
                        producer_id: producer_id.clone(),
                        peer_id: peer_id.clone(),
                        kind,
                        app_data,
                    },
                );
                true
            } else {
                false
            }
        };
        if !registered {
            info!(
                room_id = %room_id,
                peer_id = %peer_id,
                producer_id = %producer_id,
                "Peer left while producing, discarding producer"
            );
            producer.close().await;
            return Err(SignalError::NotInRoom(room_id));
        }

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        self.cleanup.watch_producer(room_id, producer);
        Ok(Reply::Body(ResponseBody::Produced { producer_id }))
    }

    async fn get_existing_producers(
        &self,
        peer_id: &PeerId,
        id: u64,
        room_id: RoomId,
        sink: &OutboundSink,
    ) -> Result<Reply> {
        let room = self.joined_room(peer_id, &room_id)?;
        let Ok(permit) = sink.reserve().await else {
            return Ok(Reply::Sent);
        };

        let state = room.lock();
        let producers = state.producers_excluding(peer_id);
        permit.send(ServerMessage::response(
            id,
            Ok(ResponseBody::Producers { producers }),
        ));
        drop(state);
        Ok(Reply::Sent)
    }

    async fn consume(
        &self,
        peer_id: &PeerId,
        id: u64,
        room_id: RoomId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        sink: &OutboundSink,
    ) -> Result<Reply> {
        let room = self.joined_room(peer_id, &room_id)?;
        let transport = {
            let state = room.lock();
            if !state.producers.contains_key(&producer_id) {
                return Err(SignalError::ProducerNotFound(producer_id));
            }
            state
                .transport(peer_id, Direction::Consumer)
                .map(|t| Arc::clone(&t.handle))
                .ok_or_else(|| {
                    SignalError::TransportNotFound("no consumer transport".to_string())
                })?
        };
        if !room.router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(SignalError::IncompatibleCapabilities(producer_id));
        }

        let consumer = transport
            .consume(&producer_id, rtp_capabilities, true)
            .await?;
        let consumer_id = consumer.id().clone();

        let Ok(permit) = sink.reserve().await else {
            consumer.close().await;
            return Ok(Reply::Sent);
        };

        let registered = {
            let mut state = room.lock();
            let producer_owner = state.producers.get(&producer_id).map(|p| p.owner.clone());
            let transport_current = state
                .transport(peer_id, Direction::Consumer)
                .is_some_and(|t| t.handle.id() == transport.id());
            match producer_owner {
                _ if !state.is_member(peer_id) => Err(SignalError::NotInRoom(room_id.clone())),
                None => Err(SignalError::ProducerNotFound(producer_id.clone())),
                Some(_) if !transport_current => Err(SignalError::TransportNotFound(
                    transport.id().to_string(),
                )),
                Some(producer_owner) => {
                    let kind = consumer.kind();
                    state.consumers.insert(
                        consumer_id.clone(),
                        ConsumerEntry {
                            handle: Arc::clone(&consumer),
                            owner: peer_id.clone(),
                            producer_id: producer_id.clone(),
                            kind,
                            paused: true,
                        },
                    );
                    permit.send(ServerMessage::response(
                        id,
                        Ok(ResponseBody::Consumed(ConsumerInfo {
                            consumer_id: consumer_id.clone(),
                            producer_id: producer_id.clone(),
                            peer_id: producer_owner,
                            kind,
                            rtp_parameters: consumer.rtp_parameters(),
                            paused: true,
                        })),
                    ));
                    Ok(())
                }
            }
        };
        if let Err(err) = registered {
            debug!(
                room_id = %room_id,
                peer_id = %peer_id,
                consumer_id = %consumer_id,
                error = %err,
                "Discarding consumer"
            );
            consumer.close().await;
            return Err(err);
        }

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            "Consumer created"
        );
        Ok(Reply::Sent)
    }

    async fn set_consumer_paused(
        &self,
        peer_id: &PeerId,
        room_id: RoomId,
        consumer_id: ConsumerId,
        paused: bool,
    ) -> Result<Reply> {
        let room = self.joined_room(peer_id, &room_id)?;
        let consumer = room
            .lock()
            .consumers
            .get(&consumer_id)
            .filter(|c| &c.owner == peer_id)
            .map(|c| Arc::clone(&c.handle))
            .ok_or_else(|| SignalError::ConsumerNotFound(consumer_id.clone()))?;

        if paused {
            consumer.pause().await?;
        } else {
            consumer.resume().await?;
        }

        match room.lock().consumers.get_mut(&consumer_id) {
            Some(entry) => entry.paused = paused,
            None => {
                warn!(
                    room_id = %room_id,
                    consumer_id = %consumer_id,
                    "Consumer removed while changing pause state"
                );
                return Err(SignalError::ConsumerNotFound(consumer_id));
            }
        }
        debug!(room_id = %room_id, consumer_id = %consumer_id, paused, "Consumer pause state changed");
        Ok(Reply::Body(ResponseBody::Ack {}))
    }
}
