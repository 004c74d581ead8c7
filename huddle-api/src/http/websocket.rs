//! Signaling WebSocket
//!
//! One connection is one peer session. Text frames carry JSON requests;
//! responses and notifications go back as text frames in the order the SFU
//! queued them. Requests run one at a time on a worker task so the reader
//! keeps watching the socket, and a close during an in-flight request
//! starts disconnect cleanup straight away.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use huddle_sfu::{PeerId, ServerMessage, SfuManager};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::http::AppState;

/// Signaling frames are small; the 64MB default is excessive
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Requests read ahead of the one being handled
const REQUEST_QUEUE_CAPACITY: usize = 32;

/// Upgrade to a signaling connection
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let manager = Arc::clone(&state.sfu_manager);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: Arc<SfuManager>) {
    let (sink, stream) = socket.split();
    serve_connection(manager, stream, sink).await;
}

/// Run one signaling connection until the client goes away, then release
/// everything the peer owned.
pub async fn serve_connection<R, E, W>(manager: Arc<SfuManager>, mut incoming: R, outgoing: W)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
{
    let (peer_id, outbound) = manager.connect();
    info!(peer_id = %peer_id, "Signaling connection established");

    let writer = tokio::spawn(write_loop(peer_id.clone(), outbound, outgoing));

    let (request_tx, mut request_rx) = mpsc::channel::<String>(REQUEST_QUEUE_CAPACITY);
    let worker = tokio::spawn({
        let manager = Arc::clone(&manager);
        let peer_id = peer_id.clone();
        async move {
            while let Some(text) = request_rx.recv().await {
                manager.handle_text(&peer_id, &text).await;
            }
        }
    });

    while let Some(frame) = incoming.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if request_tx.send(text.as_str().to_owned()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!(peer_id = %peer_id, "Ignoring binary frame on signaling connection");
            }
            Ok(Message::Close(_)) => break,
            // ping/pong are answered by axum
            Ok(_) => {}
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    drop(request_tx);
    manager.disconnect(&peer_id).await;
    // requests still queued are dropped now that the session is marked left
    if let Err(e) = worker.await {
        error!(peer_id = %peer_id, error = %e, "Signaling worker failed");
    }
    writer.abort();

    info!(peer_id = %peer_id, "Signaling connection closed");
}

async fn write_loop<W>(peer_id: PeerId, mut outbound: mpsc::Receiver<ServerMessage>, mut sink: W)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(message) = outbound.recv().await {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(peer_id = %peer_id, error = %e, "Failed to encode server message");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!(peer_id = %peer_id, error = %e, "Failed to send WebSocket message");
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use huddle_sfu::engine::loopback::{LoopbackConfig, LoopbackEngine};
    use huddle_sfu::SfuConfig;
    use serde_json::Value;
    use std::convert::Infallible;

    type Incoming = UnboundedSender<Result<Message, Infallible>>;

    fn manager() -> Arc<SfuManager> {
        let engine = LoopbackEngine::started(LoopbackConfig::default()).unwrap();
        SfuManager::new(SfuConfig::default(), Arc::new(engine))
    }

    fn send(incoming: &Incoming, text: &str) {
        incoming
            .unbounded_send(Ok(Message::Text(text.to_string().into())))
            .unwrap();
    }

    async fn next_json(outgoing: &mut UnboundedReceiver<Message>) -> Value {
        match outgoing.next().await {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let manager = manager();
        let (in_tx, in_rx) = unbounded();
        let (out_tx, mut out_rx) = unbounded();
        let connection = tokio::spawn(serve_connection(Arc::clone(&manager), in_rx, out_tx));

        send(&in_tx, r#"{"id":1,"method":"createRoom","data":{"roomId":"ws-room"}}"#);
        let created = next_json(&mut out_rx).await;
        assert_eq!(created["type"], "response");
        assert_eq!(created["id"], 1);
        assert_eq!(created["ok"], true);
        assert_eq!(created["data"]["roomId"], "ws-room");

        send(&in_tx, r#"{"id":2,"method":"joinRoom","data":{"roomId":"ws-room"}}"#);
        let joined = next_json(&mut out_rx).await;
        assert_eq!(joined["id"], 2);
        assert_eq!(joined["data"]["peers"].as_array().unwrap().len(), 1);
        assert_eq!(manager.stats().sessions.joined_sessions, 1);

        drop(in_tx);
        connection.await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.rooms.active_rooms, 0);
        assert_eq!(stats.sessions.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_response() {
        let manager = manager();
        let (in_tx, in_rx) = unbounded();
        let (out_tx, mut out_rx) = unbounded();
        let connection = tokio::spawn(serve_connection(Arc::clone(&manager), in_rx, out_tx));

        send(&in_tx, "definitely not json");
        let response = next_json(&mut out_rx).await;
        assert_eq!(response["id"], 0);
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"]["kind"], "InvalidRequest");

        // the connection stays usable
        send(&in_tx, r#"{"id":7,"method":"createRoom","data":{}}"#);
        assert_eq!(next_json(&mut out_rx).await["ok"], true);

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        connection.await.unwrap();
        assert!(manager.sessions().is_empty());
    }
}
