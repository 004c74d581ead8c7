// Shared helpers for the signaling scenario tests
//
// - `TestPeer`: a connection driving the manager the way a WebSocket client would
// - `GatedEngine`: wraps the loopback engine so a test can hold router creation
//   or a `produce` reply at a suspension point and interleave other work, and
//   records what a watched viewer had queued when each producer was released

#![allow(dead_code)]

use async_trait::async_trait;
use huddle_sfu::engine::loopback::{LoopbackConfig, LoopbackEngine};
use huddle_sfu::engine::{
    EngineConsumer, EngineProducer, EngineRouter, EngineTransport, MediaEngine, TransportOptions,
    TransportParams,
};
use huddle_sfu::protocol::{ConsumerInfo, JoinedRoom, TransportCreated};
use huddle_sfu::{
    ClientRequest, Direction, EngineResult, Event, MediaKind, OutboundSink, PeerId, ProducerId,
    Request, ResponseBody, RoomId, ServerMessage, SfuConfig, SfuManager, SignalError,
    TransportId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn loopback() -> Arc<LoopbackEngine> {
    Arc::new(LoopbackEngine::started(LoopbackConfig::default()).unwrap())
}

pub fn manager_with(engine: Arc<dyn MediaEngine>, config: SfuConfig) -> Arc<SfuManager> {
    SfuManager::new(config, engine)
}

pub fn dtls() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF" }]
    })
}

pub fn rtp_parameters(kind: MediaKind) -> Value {
    match kind {
        MediaKind::Audio => json!({
            "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }],
            "encodings": [{ "ssrc": 1111 }]
        }),
        MediaKind::Video => json!({
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": [{ "ssrc": 2222 }]
        }),
    }
}

pub fn rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ]
    })
}

/// One signaling connection
pub struct TestPeer {
    pub id: PeerId,
    rx: mpsc::Receiver<ServerMessage>,
    next_request: u64,
    events: VecDeque<Event>,
}

impl TestPeer {
    pub fn connect(manager: &SfuManager) -> Self {
        let (id, rx) = manager.connect();
        Self {
            id,
            rx,
            next_request: 0,
            events: VecDeque::new(),
        }
    }

    /// Issue a request and wait for its response; notifications that arrive
    /// first are kept for [`TestPeer::events`]
    pub async fn request(
        &mut self,
        manager: &SfuManager,
        request: Request,
    ) -> Result<ResponseBody, SignalError> {
        self.next_request += 1;
        let id = self.next_request;
        manager.handle(&self.id, ClientRequest { id, request }).await;
        self.response(id).await
    }

    pub async fn response(&mut self, id: u64) -> Result<ResponseBody, SignalError> {
        loop {
            match self.recv().await {
                ServerMessage::Response { id: got, result } if got == id => return result,
                ServerMessage::Response { id: got, .. } => panic!("unexpected response {got}"),
                ServerMessage::Notification(event) => self.events.push_back(event),
            }
        }
    }

    /// Next request id the helper will use
    pub fn next_id(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }

    pub async fn recv(&mut self) -> ServerMessage {
        timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a server message")
            .expect("outbound queue closed")
    }

    /// Wait for the next notification
    pub async fn next_event(&mut self) -> Event {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        match self.recv().await {
            ServerMessage::Notification(event) => event,
            other => panic!("expected a notification, got {other:?}"),
        }
    }

    /// All notifications received so far, without waiting
    pub fn events(&mut self) -> Vec<Event> {
        while let Ok(message) = self.rx.try_recv() {
            match message {
                ServerMessage::Notification(event) => self.events.push_back(event),
                other => panic!("unexpected message {other:?}"),
            }
        }
        self.events.drain(..).collect()
    }

    pub async fn create_room(&mut self, manager: &SfuManager, room_id: Option<&str>) -> RoomId {
        match self
            .request(manager, Request::CreateRoom { room_id: room_id.map(RoomId::from) })
            .await
        {
            Ok(ResponseBody::RoomCreated { room_id }) => room_id,
            other => panic!("createRoom failed: {other:?}"),
        }
    }

    pub async fn join(&mut self, manager: &SfuManager, room_id: &RoomId) -> JoinedRoom {
        match self
            .request(
                manager,
                Request::JoinRoom {
                    room_id: room_id.clone(),
                    display_name: None,
                },
            )
            .await
        {
            Ok(ResponseBody::Joined(joined)) => joined,
            other => panic!("joinRoom failed: {other:?}"),
        }
    }

    pub async fn create_transport(
        &mut self,
        manager: &SfuManager,
        room_id: &RoomId,
        direction: Direction,
    ) -> TransportCreated {
        match self
            .request(
                manager,
                Request::CreateTransport {
                    room_id: room_id.clone(),
                    direction,
                },
            )
            .await
        {
            Ok(ResponseBody::TransportCreated(created)) => created,
            other => panic!("createTransport failed: {other:?}"),
        }
    }

    pub async fn connect_transport(
        &mut self,
        manager: &SfuManager,
        room_id: &RoomId,
        direction: Direction,
        transport_id: TransportId,
    ) -> Result<ResponseBody, SignalError> {
        self.request(
            manager,
            Request::ConnectTransport {
                room_id: room_id.clone(),
                direction,
                transport_id,
                dtls_parameters: dtls(),
            },
        )
        .await
    }

    /// Create and connect a transport in one go
    pub async fn open_transport(
        &mut self,
        manager: &SfuManager,
        room_id: &RoomId,
        direction: Direction,
    ) -> TransportId {
        let created = self.create_transport(manager, room_id, direction).await;
        self.connect_transport(manager, room_id, direction, created.params.id.clone())
            .await
            .unwrap();
        created.params.id
    }

    pub async fn produce(
        &mut self,
        manager: &SfuManager,
        room_id: &RoomId,
        kind: MediaKind,
    ) -> ProducerId {
        match self
            .request(
                manager,
                Request::Produce {
                    room_id: room_id.clone(),
                    kind,
                    rtp_parameters: rtp_parameters(kind),
                    app_data: json!({ "peerId": self.id, "role": "camera" }),
                },
            )
            .await
        {
            Ok(ResponseBody::Produced { producer_id }) => producer_id,
            other => panic!("produce failed: {other:?}"),
        }
    }

    pub async fn consume(
        &mut self,
        manager: &SfuManager,
        room_id: &RoomId,
        producer_id: &ProducerId,
    ) -> Result<ConsumerInfo, SignalError> {
        self.request(
            manager,
            Request::Consume {
                room_id: room_id.clone(),
                producer_id: producer_id.clone(),
                rtp_capabilities: rtp_capabilities(),
            },
        )
        .await
        .map(|body| match body {
            ResponseBody::Consumed(info) => info,
            other => panic!("unexpected consume response {other:?}"),
        })
    }
}

/// Suspension points a test can hold shut
#[derive(Default)]
pub struct Gates {
    pub router: Option<Gate>,
    pub produce: Option<Gate>,
    pub producer_closes: CloseLog,
}

/// Depth of one viewer's outbound queue at each engine producer close
#[derive(Default)]
pub struct CloseLog {
    viewer: Mutex<Option<OutboundSink>>,
    closes: Mutex<Vec<(ProducerId, usize)>>,
}

impl CloseLog {
    pub fn watch(&self, viewer: OutboundSink) {
        *self.viewer.lock() = Some(viewer);
    }

    fn record(&self, producer_id: &ProducerId) {
        let queued = self
            .viewer
            .lock()
            .as_ref()
            .map_or(0, |sink| sink.max_capacity() - sink.capacity());
        self.closes.lock().push((producer_id.clone(), queued));
    }

    /// Messages the viewer had queued when `producer_id` was first closed
    pub fn queued_at_close(&self, producer_id: &ProducerId) -> Option<usize> {
        self.closes
            .lock()
            .iter()
            .find(|(id, _)| id == producer_id)
            .map(|(_, queued)| *queued)
    }
}

/// A hold on one kind of engine call: `entered` fires when a call arrives,
/// `open` lets calls through
pub struct Gate {
    pub entered: Notify,
    pub release: Semaphore,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release
            .acquire()
            .await
            .expect("gate semaphore closed")
            .forget();
    }

    pub fn open(&self, calls: usize) {
        self.release.add_permits(calls);
    }
}

pub struct GatedEngine {
    pub inner: Arc<LoopbackEngine>,
    pub gates: Arc<Gates>,
}

impl GatedEngine {
    pub fn new(inner: Arc<LoopbackEngine>, gates: Gates) -> Self {
        Self {
            inner,
            gates: Arc::new(gates),
        }
    }
}

#[async_trait]
impl MediaEngine for GatedEngine {
    async fn create_router(&self) -> EngineResult<Arc<dyn EngineRouter>> {
        if let Some(gate) = &self.gates.router {
            gate.pass().await;
        }
        let inner = self.inner.create_router().await?;
        Ok(Arc::new(GatedRouter {
            inner,
            gates: Arc::clone(&self.gates),
        }))
    }

    async fn closed(&self) {
        self.inner.closed().await;
    }
}

struct GatedRouter {
    inner: Arc<dyn EngineRouter>,
    gates: Arc<Gates>,
}

#[async_trait]
impl EngineRouter for GatedRouter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn rtp_capabilities(&self) -> Value {
        self.inner.rtp_capabilities()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool {
        self.inner.can_consume(producer_id, rtp_capabilities)
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>> {
        let inner = self.inner.create_transport(options).await?;
        Ok(Arc::new(GatedTransport {
            inner,
            gates: Arc::clone(&self.gates),
        }))
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

struct GatedTransport {
    inner: Arc<dyn EngineTransport>,
    gates: Arc<Gates>,
}

#[async_trait]
impl EngineTransport for GatedTransport {
    fn id(&self) -> &TransportId {
        self.inner.id()
    }

    fn params(&self) -> TransportParams {
        self.inner.params()
    }

    async fn connect(&self, dtls_parameters: Value) -> EngineResult<()> {
        self.inner.connect(dtls_parameters).await
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> EngineResult<Arc<dyn EngineProducer>> {
        let inner = self.inner.produce(kind, rtp_parameters, app_data).await?;
        // hold the reply as if it were still in flight
        if let Some(gate) = &self.gates.produce {
            gate.pass().await;
        }
        Ok(Arc::new(GatedProducer {
            inner,
            gates: Arc::clone(&self.gates),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn EngineConsumer>> {
        self.inner.consume(producer_id, rtp_capabilities, paused).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

struct GatedProducer {
    inner: Arc<dyn EngineProducer>,
    gates: Arc<Gates>,
}

#[async_trait]
impl EngineProducer for GatedProducer {
    fn id(&self) -> &ProducerId {
        self.inner.id()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind()
    }

    async fn ended(&self) {
        self.inner.ended().await;
    }

    async fn close(&self) {
        self.gates.producer_closes.record(self.inner.id());
        self.inner.close().await;
    }
}
