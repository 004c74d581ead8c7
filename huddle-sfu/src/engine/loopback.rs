//! In-process media engine
//!
//! Implements the whole engine surface with real bookkeeping (ids, codec
//! matching, ICE/DTLS parameter blobs, pause state, close cascades) but moves
//! no media. Lifetimes form a `CancellationToken` tree: engine → router →
//! transport → producer/consumer, so closing a parent closes every child.

use crate::engine::{
    EngineConsumer, EngineProducer, EngineRouter, EngineTransport, MediaEngine,
    TransportOptions, TransportParams,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{ConsumerId, Direction, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First dynamic RTP payload type handed out to router codecs
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// A codec the router is willing to route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl RtpCodecCapability {
    #[must_use]
    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        }
    }

    #[must_use]
    pub fn vp8() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
        }
    }

    #[must_use]
    pub fn h264() -> Self {
        let mut parameters = Map::new();
        parameters.insert("packetization-mode".to_string(), json!(1));
        parameters.insert("profile-level-id".to_string(), json!("42e01f"));
        Self {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters,
        }
    }
}

/// Loopback engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            media_codecs: vec![
                RtpCodecCapability::opus(),
                RtpCodecCapability::vp8(),
                RtpCodecCapability::h264(),
            ],
        }
    }
}

/// Live object counts, for introspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopbackStats {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

struct ProducerRecord {
    router_id: String,
    kind: MediaKind,
    mime_type: String,
    lifetime: CancellationToken,
}

/// Bookkeeping shared by every object the engine hands out
struct Registry {
    config: LoopbackConfig,
    next_port: AtomicU32,
    routers: DashMap<String, CancellationToken>,
    transports: DashMap<TransportId, CancellationToken>,
    producers: DashMap<ProducerId, ProducerRecord>,
    consumers: DashMap<ConsumerId, CancellationToken>,
}

impl Registry {
    fn allocate_port(&self) -> u16 {
        let span = u32::from(self.config.rtc_max_port - self.config.rtc_min_port) + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span <= u16::MAX + 1, and min + offset <= max
        self.config.rtc_min_port + u16::try_from(offset).unwrap_or(0)
    }

    fn prune(&self) {
        self.routers.retain(|_, t| !t.is_cancelled());
        self.transports.retain(|_, t| !t.is_cancelled());
        self.producers.retain(|_, r| !r.lifetime.is_cancelled());
        self.consumers.retain(|_, t| !t.is_cancelled());
    }

    fn router_codecs(&self) -> Value {
        let mut next_pt = FIRST_DYNAMIC_PAYLOAD_TYPE;
        let codecs: Vec<Value> = self
            .config
            .media_codecs
            .iter()
            .map(|codec| {
                let pt = next_pt;
                next_pt = next_pt.saturating_add(1);
                let mut value = serde_json::to_value(codec).unwrap_or_else(|_| json!({}));
                if let Value::Object(map) = &mut value {
                    map.insert("preferredPayloadType".to_string(), json!(pt));
                }
                value
            })
            .collect();
        json!({ "codecs": codecs, "headerExtensions": [] })
    }

    fn codec(&self, mime_type: &str) -> Option<(u8, &RtpCodecCapability)> {
        self.config
            .media_codecs
            .iter()
            .enumerate()
            .find(|(_, c)| c.mime_type.eq_ignore_ascii_case(mime_type))
            .map(|(i, c)| {
                let pt = FIRST_DYNAMIC_PAYLOAD_TYPE.saturating_add(u8::try_from(i).unwrap_or(u8::MAX));
                (pt, c)
            })
    }
}

fn capability_mime_types(rtp_capabilities: &Value) -> impl Iterator<Item = &str> {
    rtp_capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
}

fn random_fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn random_ssrc() -> u32 {
    let bytes = Uuid::new_v4().into_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// In-process media engine
pub struct LoopbackEngine {
    registry: Arc<Registry>,
    ready: AtomicBool,
    lifetime: CancellationToken,
}

impl LoopbackEngine {
    /// Create an engine that refuses work until [`LoopbackEngine::start`]
    #[must_use]
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                config,
                next_port: AtomicU32::new(0),
                routers: DashMap::new(),
                transports: DashMap::new(),
                producers: DashMap::new(),
                consumers: DashMap::new(),
            }),
            ready: AtomicBool::new(false),
            lifetime: CancellationToken::new(),
        }
    }

    /// Create and start an engine in one step
    pub fn started(config: LoopbackConfig) -> EngineResult<Self> {
        let engine = Self::new(config);
        engine.start()?;
        Ok(engine)
    }

    pub fn start(&self) -> EngineResult<()> {
        if self.lifetime.is_cancelled() {
            return Err(EngineError::Closed);
        }
        let config = &self.registry.config;
        if config.rtc_min_port > config.rtc_max_port {
            return Err(EngineError::Unavailable(format!(
                "invalid rtc port range {}-{}",
                config.rtc_min_port, config.rtc_max_port
            )));
        }
        if config.media_codecs.is_empty() {
            return Err(EngineError::Unavailable("no media codecs configured".to_string()));
        }
        self.ready.store(true, Ordering::Release);
        info!(
            listen_ip = %config.listen_ip,
            rtc_ports = %format!("{}-{}", config.rtc_min_port, config.rtc_max_port),
            codecs = config.media_codecs.len(),
            "Loopback media engine started"
        );
        Ok(())
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.lifetime.is_cancelled()
    }

    /// Kill the engine permanently. Everything it handed out is closed.
    pub fn shutdown(&self) {
        if !self.lifetime.is_cancelled() {
            warn!("Loopback media engine shutting down");
            self.lifetime.cancel();
        }
    }

    /// End a producer from the engine side, as if its track stopped upstream
    pub fn end_producer(&self, producer_id: &ProducerId) -> bool {
        self.registry
            .producers
            .get(producer_id)
            .map(|record| record.lifetime.cancel())
            .is_some()
    }

    #[must_use]
    pub fn stats(&self) -> LoopbackStats {
        self.registry.prune();
        LoopbackStats {
            routers: self.registry.routers.len(),
            transports: self.registry.transports.len(),
            producers: self.registry.producers.len(),
            consumers: self.registry.consumers.len(),
        }
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(&self) -> EngineResult<Arc<dyn EngineRouter>> {
        if self.lifetime.is_cancelled() {
            return Err(EngineError::Closed);
        }
        if !self.ready.load(Ordering::Acquire) {
            return Err(EngineError::Unavailable("media workers not started".to_string()));
        }
        self.registry.prune();

        let router = LoopbackRouter {
            id: Uuid::new_v4().to_string(),
            rtp_capabilities: self.registry.router_codecs(),
            lifetime: self.lifetime.child_token(),
            registry: Arc::clone(&self.registry),
        };
        self.registry
            .routers
            .insert(router.id.clone(), router.lifetime.clone());
        debug!(router_id = %router.id, "Router created");
        Ok(Arc::new(router))
    }

    async fn closed(&self) {
        self.lifetime.cancelled().await;
    }
}

struct LoopbackRouter {
    id: String,
    rtp_capabilities: Value,
    lifetime: CancellationToken,
    registry: Arc<Registry>,
}

#[async_trait]
impl EngineRouter for LoopbackRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool {
        let Some(record) = self.registry.producers.get(producer_id) else {
            return false;
        };
        if record.router_id != self.id || record.lifetime.is_cancelled() {
            return false;
        }
        let mut mime_types = capability_mime_types(rtp_capabilities);
        mime_types.any(|mime| mime.eq_ignore_ascii_case(&record.mime_type))
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>> {
        if self.lifetime.is_cancelled() {
            return Err(EngineError::Rejected("router closed".to_string()));
        }
        let config = &self.registry.config;
        let ip = config
            .announced_ip
            .clone()
            .unwrap_or_else(|| config.listen_ip.to_string());
        let port = self.registry.allocate_port();

        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "priority": if options.prefer_udp { 1_076_302_079_u32 } else { 1_076_301_823 },
                "ip": ip,
                "port": port,
                "protocol": "udp",
                "type": "host",
            }));
        }
        if options.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "priority": if options.prefer_udp { 1_076_276_479_u32 } else { 1_076_302_079 },
                "ip": ip,
                "port": port,
                "protocol": "tcp",
                "type": "host",
                "tcpType": "passive",
            }));
        }
        if candidates.is_empty() {
            return Err(EngineError::Rejected(
                "transport needs at least one of udp or tcp".to_string(),
            ));
        }

        let id = TransportId::new(Uuid::new_v4().to_string());
        let params = TransportParams {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": nanoid::nanoid!(16),
                "password": nanoid::nanoid!(32),
                "iceLite": true,
            }),
            ice_candidates: Value::Array(candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": random_fingerprint() }],
            }),
        };
        let lifetime = self.lifetime.child_token();
        self.registry.transports.insert(id.clone(), lifetime.clone());
        debug!(router_id = %self.id, transport_id = %id, direction = %options.direction, "Transport created");

        Ok(Arc::new(LoopbackTransport {
            id,
            router_id: self.id.clone(),
            direction: options.direction,
            params,
            connected: AtomicBool::new(false),
            lifetime,
            registry: Arc::clone(&self.registry),
        }))
    }

    async fn close(&self) {
        self.lifetime.cancel();
        self.registry.routers.remove(&self.id);
    }
}

struct LoopbackTransport {
    id: TransportId,
    router_id: String,
    direction: Direction,
    params: TransportParams,
    connected: AtomicBool,
    lifetime: CancellationToken,
    registry: Arc<Registry>,
}

#[async_trait]
impl EngineTransport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> EngineResult<()> {
        if self.lifetime.is_cancelled() {
            return Err(EngineError::Rejected("transport closed".to_string()));
        }
        let has_fingerprint = dtls_parameters
            .get("fingerprints")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if !has_fingerprint {
            return Err(EngineError::Rejected(
                "dtlsParameters must carry at least one fingerprint".to_string(),
            ));
        }
        if self
            .connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::Rejected("connect() already called".to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        _app_data: Value,
    ) -> EngineResult<Arc<dyn EngineProducer>> {
        if self.lifetime.is_cancelled() {
            return Err(EngineError::Rejected("transport closed".to_string()));
        }
        if self.direction != Direction::Producer {
            return Err(EngineError::Rejected(
                "cannot produce on a consumer transport".to_string(),
            ));
        }
        let mime_type = rtp_parameters
            .get("codecs")
            .and_then(Value::as_array)
            .and_then(|codecs| codecs.first())
            .and_then(|codec| codec.get("mimeType"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Rejected("rtpParameters must include at least one codec".to_string())
            })?;
        let (_, codec) = self
            .registry
            .codec(mime_type)
            .ok_or_else(|| EngineError::Rejected(format!("unsupported codec {mime_type}")))?;
        if codec.kind != kind {
            return Err(EngineError::Rejected(format!(
                "codec {mime_type} does not match kind {kind}"
            )));
        }

        let id = ProducerId::new(Uuid::new_v4().to_string());
        let lifetime = self.lifetime.child_token();
        self.registry.producers.insert(
            id.clone(),
            ProducerRecord {
                router_id: self.router_id.clone(),
                kind,
                mime_type: codec.mime_type.clone(),
                lifetime: lifetime.clone(),
            },
        );
        debug!(transport_id = %self.id, producer_id = %id, kind = %kind, "Producer created");

        Ok(Arc::new(LoopbackProducer {
            id,
            kind,
            lifetime,
            registry: Arc::clone(&self.registry),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn EngineConsumer>> {
        if self.lifetime.is_cancelled() {
            return Err(EngineError::Rejected("transport closed".to_string()));
        }
        if self.direction != Direction::Consumer {
            return Err(EngineError::Rejected(
                "cannot consume on a producer transport".to_string(),
            ));
        }
        let (kind, mime_type, producer_lifetime) = {
            let record = self
                .registry
                .producers
                .get(producer_id)
                .filter(|r| r.router_id == self.router_id && !r.lifetime.is_cancelled())
                .ok_or_else(|| EngineError::Rejected(format!("producer {producer_id} not found")))?;
            (record.kind, record.mime_type.clone(), record.lifetime.clone())
        };
        if !capability_mime_types(&rtp_capabilities).any(|m| m.eq_ignore_ascii_case(&mime_type)) {
            return Err(EngineError::Rejected(format!(
                "cannot consume {mime_type} with the given rtpCapabilities"
            )));
        }
        let (payload_type, codec) = self
            .registry
            .codec(&mime_type)
            .ok_or_else(|| EngineError::Rejected(format!("unsupported codec {mime_type}")))?;

        let mut codec_params = json!({
            "mimeType": codec.mime_type,
            "payloadType": payload_type,
            "clockRate": codec.clock_rate,
            "parameters": codec.parameters,
        });
        if let (Some(channels), Value::Object(map)) = (codec.channels, &mut codec_params) {
            map.insert("channels".to_string(), json!(channels));
        }
        let id = ConsumerId::new(Uuid::new_v4().to_string());
        let rtp_parameters = json!({
            "mid": id.as_str(),
            "codecs": [codec_params],
            "encodings": [{ "ssrc": random_ssrc() }],
            "rtcp": { "cname": nanoid::nanoid!(8), "reducedSize": true },
        });

        let lifetime = self.lifetime.child_token();
        self.registry.consumers.insert(id.clone(), lifetime.clone());
        debug!(transport_id = %self.id, consumer_id = %id, producer_id = %producer_id, "Consumer created");

        Ok(Arc::new(LoopbackConsumer {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            lifetime,
            producer_lifetime,
            registry: Arc::clone(&self.registry),
        }))
    }

    async fn close(&self) {
        self.lifetime.cancel();
        self.registry.transports.remove(&self.id);
    }
}

struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    lifetime: CancellationToken,
    registry: Arc<Registry>,
}

#[async_trait]
impl EngineProducer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn ended(&self) {
        self.lifetime.cancelled().await;
    }

    async fn close(&self) {
        self.lifetime.cancel();
        self.registry.producers.remove(&self.id);
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: Value,
    paused: AtomicBool,
    lifetime: CancellationToken,
    producer_lifetime: CancellationToken,
    registry: Arc<Registry>,
}

impl LoopbackConsumer {
    fn is_closed(&self) -> bool {
        self.lifetime.is_cancelled() || self.producer_lifetime.is_cancelled()
    }
}

#[async_trait]
impl EngineConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Rejected("consumer closed".to_string()));
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn pause(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Rejected("consumer closed".to_string()));
        }
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.lifetime.cancel();
        self.registry.consumers.remove(&self.id);
    }
}
