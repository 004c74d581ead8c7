// Module: http
// REST endpoints for room management and the signaling WebSocket

pub mod error;
pub mod health;
pub mod room;
pub mod websocket;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use huddle_core::config::ServerConfig;
use huddle_sfu::SfuManager;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sfu_manager: Arc<SfuManager>,
}

/// Create the HTTP router with all routes
pub fn create_router(sfu_manager: Arc<SfuManager>, server: &ServerConfig) -> Router {
    let state = AppState { sfu_manager };

    let router = Router::new()
        // Health check endpoints (for monitoring probes)
        .merge(health::create_health_router())
        // Room management routes
        .route("/api/rooms", post(room::create_room))
        .route("/api/rooms/{room_id}", get(room::get_room))
        .route("/api/rooms/{room_id}/members", get(room::get_room_members))
        // Signaling WebSocket
        .route("/ws", get(websocket::websocket_handler))
        .fallback(|| async { AppError::not_found("no such route") });

    // Apply layers before state
    let router = router
        .layer(cors_layer(&server.cors_allowed_origins))
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
