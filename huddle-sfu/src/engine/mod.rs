//! Media engine boundary
//!
//! The SFU control plane never touches packets. Everything below the signaling
//! layer (routers, ICE/DTLS transports, RTP producers and consumers) lives in a
//! media engine reached through these traits. Handles are reference counted and
//! `close()` is idempotent on all of them.
//!
//! [`loopback::LoopbackEngine`] implements the full surface in-process without
//! forwarding media; it backs development servers and the test suite.

pub mod loopback;

use crate::error::EngineResult;
use crate::types::{ConsumerId, Direction, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Options for a new WebRTC transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub direction: Direction,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl TransportOptions {
    #[must_use]
    pub const fn new(direction: Direction) -> Self {
        Self {
            direction,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// Connection parameters a client needs to set up its side of a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Entry point into a media engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Allocate a router. One router per room scopes codec negotiation.
    async fn create_router(&self) -> EngineResult<Arc<dyn EngineRouter>>;

    /// Resolves once the engine has died and will never serve again.
    async fn closed(&self);
}

#[async_trait]
pub trait EngineRouter: Send + Sync {
    fn id(&self) -> &str;

    /// RTP capabilities clients load their device with
    fn rtp_capabilities(&self) -> Value;

    /// Whether a consumer with these capabilities can receive the producer
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool;

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>>;

    /// Closing a router closes every transport, producer and consumer on it.
    async fn close(&self);
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: Value) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> EngineResult<Arc<dyn EngineProducer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn EngineConsumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    /// Resolves when the producer is gone, whoever closed it.
    async fn ended(&self);

    async fn close(&self);
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    async fn resume(&self) -> EngineResult<()>;

    async fn pause(&self) -> EngineResult<()>;

    async fn close(&self);
}
