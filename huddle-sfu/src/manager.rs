//! SFU Manager - top-level orchestration of the signaling core
//!
//! Wires the room registry, peer sessions, broadcast hub, cleanup
//! coordinator and signaling handler around one media engine, and runs the
//! background sweep that reclaims idle transports and never-joined rooms.

use crate::cleanup::{CleanupCoordinator, SweepReport};
use crate::config::SfuConfig;
use crate::engine::MediaEngine;
use crate::error::Result;
use crate::hub::BroadcastHub;
use crate::protocol::{ClientRequest, Event, ServerMessage};
use crate::registry::{RegistryStats, RoomRegistry};
use crate::room::RoomStats;
use crate::session::{SessionMetrics, SessionRegistry};
use crate::signaling::SignalingHandler;
use crate::types::{PeerId, RoomId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Global SFU statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStats {
    #[serde(flatten)]
    pub rooms: RegistryStats,
    #[serde(flatten)]
    pub sessions: SessionMetrics,
}

pub struct SfuManager {
    config: Arc<SfuConfig>,
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionRegistry>,
    cleanup: Arc<CleanupCoordinator>,
    signaling: SignalingHandler,
    shutdown: CancellationToken,
}

impl SfuManager {
    /// Create the manager and start its background sweep.
    /// Must be called from within a tokio runtime.
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        let config = Arc::new(config);
        let hub = Arc::new(BroadcastHub::new());
        let registry = Arc::new(RoomRegistry::new(Arc::clone(&config), engine, hub));
        let sessions = Arc::new(SessionRegistry::new());
        let cleanup = Arc::new(CleanupCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&sessions),
        ));
        let signaling = SignalingHandler::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&cleanup),
        );

        let manager = Arc::new(Self {
            config,
            registry,
            sessions,
            cleanup,
            signaling,
            shutdown: CancellationToken::new(),
        });

        info!(
            max_rooms = manager.config.max_rooms,
            max_peers_per_room = manager.config.max_peers_per_room,
            transport_idle_timeout_secs = manager.config.transport_idle_timeout_secs,
            "SFU Manager initialized"
        );

        tokio::spawn(
            Arc::clone(&manager.cleanup).run_sweeper(manager.shutdown.child_token()),
        );

        manager
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Open a peer session for a new connection. Everything the server
    /// sends to the peer arrives on the returned receiver.
    pub fn connect(&self) -> (PeerId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_capacity.max(1));
        let peer_id = self.sessions.register(tx);
        (peer_id, rx)
    }

    pub async fn handle(&self, peer_id: &PeerId, request: ClientRequest) {
        self.signaling.handle(peer_id, request).await;
    }

    pub async fn handle_text(&self, peer_id: &PeerId, text: &str) {
        self.signaling.handle_text(peer_id, text).await;
    }

    /// Connection closed: release everything the peer owned. Idempotent.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        self.cleanup.disconnect(peer_id).await
    }

    pub async fn create_room(&self, requested: Option<RoomId>) -> Result<RoomId> {
        self.registry.create_room(requested).await
    }

    pub fn room_stats(&self, room_id: &RoomId) -> Result<RoomStats> {
        self.registry.room_stats(room_id)
    }

    /// Member peer ids of a room, for features layered on the room model
    pub fn members(&self, room_id: &RoomId) -> Result<Vec<PeerId>> {
        self.registry.members(room_id)
    }

    /// Send an event to every member of a room except `exclude`
    pub fn broadcast(&self, room_id: &RoomId, exclude: Option<&PeerId>, event: &Event) -> usize {
        self.registry.hub().broadcast(room_id, exclude, event)
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            rooms: self.registry.stats(),
            sessions: self.sessions.metrics(),
        }
    }

    /// Run one cleanup sweep now
    pub async fn sweep(&self) -> SweepReport {
        self.cleanup.sweep().await
    }

    /// Stop the sweep, disconnect every peer and destroy every room
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let peers = self.sessions.peer_ids();
        info!(peers = peers.len(), "Shutting down SFU manager");
        for peer_id in peers {
            self.cleanup.disconnect(&peer_id).await;
        }
        self.registry.shutdown().await;
    }
}
