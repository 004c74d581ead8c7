//! Health check endpoints
//!
//! Liveness for monitoring probes, plus SFU-wide counters.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use huddle_sfu::ManagerStats;

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(stats))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Room, peer and session counters
pub async fn stats(State(state): State<AppState>) -> Json<ManagerStats> {
    Json(state.sfu_manager.stats())
}
