//! Signaling wire protocol
//!
//! Requests: `{"id": 7, "method": "produce", "data": {...}}`
//!
//! Responses: `{"type": "response", "id": 7, "ok": true, "data": {...}}` or
//! `{"type": "response", "id": 7, "ok": false, "error": {"kind": "...", "message": "..."}}`
//!
//! Notifications: `{"type": "notification", "method": "newProducer", "data": {...}}`

use crate::engine::TransportParams;
use crate::error::SignalError;
use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, TransportId};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc;

/// Sending half of a connection's outbound queue
pub type OutboundSink = mpsc::Sender<ServerMessage>;

/// A request frame: correlation id plus the operation
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientRequest {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

impl ClientRequest {
    /// Parse a text frame. On failure returns the response to send back,
    /// carrying the frame's id when one could be read (0 otherwise).
    pub fn parse(text: &str) -> Result<Self, ServerMessage> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            ServerMessage::error(0, SignalError::InvalidRequest(e.to_string()))
        })?;
        let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
        serde_json::from_value(value)
            .map_err(|e| ServerMessage::error(id, SignalError::InvalidRequest(e.to_string())))
    }
}

/// Signaling operations. Every room-scoped operation names its room.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "method",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    CreateRoom {
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        display_name: Option<String>,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    GetRtpCapabilities {
        room_id: RoomId,
    },
    CreateTransport {
        room_id: RoomId,
        direction: Direction,
    },
    ConnectTransport {
        room_id: RoomId,
        direction: Direction,
        transport_id: TransportId,
        dtls_parameters: Value,
    },
    Produce {
        room_id: RoomId,
        kind: MediaKind,
        rtp_parameters: Value,
        #[serde(default)]
        app_data: Value,
    },
    GetExistingProducers {
        room_id: RoomId,
    },
    Consume {
        room_id: RoomId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
    },
    ResumeConsumer {
        room_id: RoomId,
        consumer_id: ConsumerId,
    },
    PauseConsumer {
        room_id: RoomId,
        consumer_id: ConsumerId,
    },
    CloseProducer {
        room_id: RoomId,
        producer_id: ProducerId,
    },
}

impl Request {
    /// Operation name as it appears on the wire
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "createRoom",
            Self::JoinRoom { .. } => "joinRoom",
            Self::LeaveRoom { .. } => "leaveRoom",
            Self::GetRtpCapabilities { .. } => "getRtpCapabilities",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::GetExistingProducers { .. } => "getExistingProducers",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resumeConsumer",
            Self::PauseConsumer { .. } => "pauseConsumer",
            Self::CloseProducer { .. } => "closeProducer",
        }
    }

    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::CreateRoom { room_id } => room_id.as_ref(),
            Self::JoinRoom { room_id, .. }
            | Self::LeaveRoom { room_id }
            | Self::GetRtpCapabilities { room_id }
            | Self::CreateTransport { room_id, .. }
            | Self::ConnectTransport { room_id, .. }
            | Self::Produce { room_id, .. }
            | Self::GetExistingProducers { room_id }
            | Self::Consume { room_id, .. }
            | Self::ResumeConsumer { room_id, .. }
            | Self::PauseConsumer { room_id, .. }
            | Self::CloseProducer { room_id, .. } => Some(room_id),
        }
    }
}

/// Room member as reported to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRoom {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    pub direction: Direction,
    #[serde(flatten)]
    pub params: TransportParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub app_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub paused: bool,
}

/// Successful response payloads
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum ResponseBody {
    RoomCreated { room_id: RoomId },
    Joined(JoinedRoom),
    RtpCapabilities { rtp_capabilities: Value },
    TransportCreated(TransportCreated),
    Produced { producer_id: ProducerId },
    Producers { producers: Vec<ProducerInfo> },
    Consumed(ConsumerInfo),
    Ack {},
}

/// Server-initiated notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    NewProducer {
        room_id: RoomId,
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        app_data: Value,
    },
    ProducerClosed {
        room_id: RoomId,
        producer_id: ProducerId,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        app_data: Value,
    },
    ConsumerClosed {
        room_id: RoomId,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    PeerJoined {
        room_id: RoomId,
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    PeerLeft {
        room_id: RoomId,
        peer_id: PeerId,
    },
    TransportClosed {
        room_id: RoomId,
        transport_id: TransportId,
        direction: Direction,
    },
}

impl Event {
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::NewProducer { .. } => "newProducer",
            Self::ProducerClosed { .. } => "producerClosed",
            Self::ConsumerClosed { .. } => "consumerClosed",
            Self::PeerJoined { .. } => "peerJoined",
            Self::PeerLeft { .. } => "peerLeft",
            Self::TransportClosed { .. } => "transportClosed",
        }
    }
}

/// Anything the server writes to a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Response {
        id: u64,
        result: Result<ResponseBody, SignalError>,
    },
    Notification(Event),
}

impl ServerMessage {
    #[must_use]
    pub const fn response(id: u64, result: Result<ResponseBody, SignalError>) -> Self {
        Self::Response { id, result }
    }

    #[must_use]
    pub const fn error(id: u64, err: SignalError) -> Self {
        Self::Response { id, result: Err(err) }
    }

    #[must_use]
    pub const fn event(&self) -> Option<&Event> {
        match self {
            Self::Notification(event) => Some(event),
            Self::Response { .. } => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Serialize)]
struct WireError {
    kind: &'static str,
    message: String,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage<'a> {
    Response {
        id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<&'a ResponseBody>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    Notification(&'a Event),
}

impl Serialize for ServerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Response { id, result: Ok(body) } => WireMessage::Response {
                id: *id,
                ok: true,
                data: Some(body),
                error: None,
            },
            Self::Response { id, result: Err(err) } => WireMessage::Response {
                id: *id,
                ok: false,
                data: None,
                error: Some(WireError {
                    kind: err.kind(),
                    message: err.to_string(),
                }),
            },
            Self::Notification(event) => WireMessage::Notification(event),
        };
        wire.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let text = r#"{"id":3,"method":"consume","data":{"roomId":"r1","producerId":"p1","rtpCapabilities":{"codecs":[]}}}"#;
        let parsed = ClientRequest::parse(text).unwrap();
        assert_eq!(parsed.id, 3);
        assert_eq!(
            parsed.request,
            Request::Consume {
                room_id: RoomId::from("r1"),
                producer_id: ProducerId::from("p1"),
                rtp_capabilities: json!({"codecs": []}),
            }
        );
        assert_eq!(parsed.request.method(), "consume");
    }

    #[test]
    fn test_optional_fields_default() {
        let parsed = ClientRequest::parse(r#"{"id":1,"method":"createRoom","data":{}}"#).unwrap();
        assert_eq!(parsed.request, Request::CreateRoom { room_id: None });

        let text = r#"{"id":2,"method":"produce","data":{"roomId":"r","kind":"audio","rtpParameters":{}}}"#;
        match ClientRequest::parse(text).unwrap().request {
            Request::Produce { app_data, .. } => assert_eq!(app_data, Value::Null),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_invalid_frames_produce_error_responses() {
        let err = ClientRequest::parse("not json").unwrap_err();
        assert!(matches!(
            err,
            ServerMessage::Response { id: 0, result: Err(SignalError::InvalidRequest(_)) }
        ));

        let err = ClientRequest::parse(r#"{"id":9,"method":"selfDestruct","data":{}}"#).unwrap_err();
        assert!(matches!(
            err,
            ServerMessage::Response { id: 9, result: Err(SignalError::InvalidRequest(_)) }
        ));
    }

    #[test]
    fn test_response_wire_format() {
        let ok = ServerMessage::response(
            4,
            Ok(ResponseBody::Produced { producer_id: ProducerId::from("p9") }),
        );
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"type": "response", "id": 4, "ok": true, "data": {"producerId": "p9"}})
        );

        let ack = ServerMessage::response(5, Ok(ResponseBody::Ack {}));
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "response", "id": 5, "ok": true, "data": {}})
        );

        let err = ServerMessage::error(6, SignalError::RoomNotFound(RoomId::from("nope")));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({
                "type": "response",
                "id": 6,
                "ok": false,
                "error": {"kind": "RoomNotFound", "message": "room nope not found"}
            })
        );
    }

    #[test]
    fn test_notification_wire_format() {
        let msg = ServerMessage::Notification(Event::ProducerClosed {
            room_id: RoomId::from("r1"),
            producer_id: ProducerId::from("p1"),
            app_data: Value::Null,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "notification",
                "method": "producerClosed",
                "data": {"roomId": "r1", "producerId": "p1"}
            })
        );
    }
}
