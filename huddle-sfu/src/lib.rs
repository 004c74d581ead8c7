//! Huddle SFU (Selective Forwarding Unit) control plane
//!
//! The authoritative in-memory state of a multi-party media server: rooms,
//! each peer's WebRTC transports, and every producer/consumer pairing, plus
//! the request/response signaling protocol peers use to negotiate them and
//! the cleanup protocol that runs when they leave.
//!
//! Packet forwarding is not done here. Everything media-level goes through
//! the [`engine::MediaEngine`] traits; [`engine::loopback::LoopbackEngine`]
//! implements them in-process for development and tests.
//!
//! ## Architecture
//!
//! - **`RoomRegistry`**: `RoomId → Room`, one engine router per room
//! - **`SessionRegistry`**: per-connection join state and outbound queue
//! - **`SignalingHandler`**: the request/response surface
//! - **`CleanupCoordinator`**: teardown on disconnect, leave and producer close
//! - **`BroadcastHub`**: room-scoped notification fan-out
//! - **`SfuManager`**: wires the above together and runs the idle sweep
//!
//! ## Usage
//!
//! ```rust,ignore
//! use huddle_sfu::{SfuConfig, SfuManager};
//! use huddle_sfu::engine::loopback::{LoopbackConfig, LoopbackEngine};
//!
//! let engine = Arc::new(LoopbackEngine::started(LoopbackConfig::default())?);
//! let manager = SfuManager::new(SfuConfig::default(), engine);
//!
//! let (peer_id, mut outbound) = manager.connect();
//! manager.handle_text(&peer_id, r#"{"id":1,"method":"createRoom","data":{}}"#).await;
//! let response = outbound.recv().await;
//! ```

mod cleanup;
mod config;
pub mod engine;
mod error;
mod hub;
mod manager;
pub mod protocol;
mod registry;
mod room;
mod session;
mod signaling;
mod types;

pub use cleanup::{CleanupCoordinator, ProducerCloseReason, SweepReport};
pub use config::SfuConfig;
pub use error::{EngineError, EngineResult, Result, SignalError};
pub use hub::BroadcastHub;
pub use manager::{ManagerStats, SfuManager};
pub use protocol::{ClientRequest, Event, OutboundSink, Request, ResponseBody, ServerMessage};
pub use registry::{RegistryStats, RoomRegistry};
pub use room::RoomStats;
pub use session::{JoinState, SessionMetrics, SessionRegistry};
pub use signaling::SignalingHandler;
pub use types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, TransportId};
