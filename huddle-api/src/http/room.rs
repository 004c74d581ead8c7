// Room management HTTP handlers
//
// Rooms can be created ahead of time over HTTP (e.g. by a scheduling
// service handing out meeting codes); everything else happens on the
// signaling WebSocket.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use huddle_sfu::{PeerId, RoomId, RoomStats};
use serde::{Deserialize, Serialize};

use super::{AppResult, AppState};

/// Create room request
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateRoomRequest {
    /// Client-chosen room id; generated when absent
    pub room_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMembersResponse {
    pub room_id: RoomId,
    pub peers: Vec<PeerId>,
}

pub async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> AppResult<(StatusCode, Json<CreateRoomResponse>)> {
    let room_id = state
        .sfu_manager
        .create_room(req.room_id.map(RoomId::from))
        .await?;
    Ok((StatusCode::CREATED, Json(CreateRoomResponse { room_id })))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomStats>> {
    Ok(Json(state.sfu_manager.room_stats(&RoomId::from(room_id))?))
}

pub async fn get_room_members(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomMembersResponse>> {
    let room_id = RoomId::from(room_id);
    let peers = state.sfu_manager.members(&room_id)?;
    Ok(Json(RoomMembersResponse { room_id, peers }))
}
