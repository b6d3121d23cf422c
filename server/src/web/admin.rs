use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::app_state::AppState;
use super::auth_middleware::AdminUser;
use super::ws_handler::{error_json, valid_room_id};

#[derive(Debug, Default, Deserialize)]
pub struct BanRequest {
    /// Minutes; clamped server-side.
    pub duration: Option<i64>,
}

/// `POST /api/chat/ban/{room}/{user}`: kick the user from the room and ban them.
pub async fn ban_user(
    State(state): State<Arc<AppState>>,
    admin: AdminUser,
    Path((room_id, user_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if !valid_room_id(&room_id) {
        return error_json(StatusCode::BAD_REQUEST, "wrong room id");
    }
    if user_id.trim().is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "missing user id");
    }

    let request: BanRequest = if body.is_empty() {
        BanRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(_) => return error_json(StatusCode::BAD_REQUEST, "invalid request body"),
        }
    };

    let minutes = state.config.bans.clamp_minutes(request.duration);
    match state
        .hub
        .ban(&room_id, &user_id, Duration::from_secs(minutes * 60))
        .await
    {
        Ok(outcome) => {
            info!(
                admin = %admin.user_id,
                %room_id,
                %user_id,
                minutes,
                kicked = outcome.kicked,
                "ban issued"
            );
            Json(json!({
                "message": "User successfully banned",
                "minutes": minutes,
            }))
            .into_response()
        }
        Err(e) => {
            error!(%room_id, %user_id, error = %e, "failed to store ban");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to ban user")
        }
    }
}

/// `GET /api/chat/rooms/{room}`: local occupancy.
pub async fn room_occupancy(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Response {
    if !valid_room_id(&room_id) {
        return error_json(StatusCode::BAD_REQUEST, "wrong room id");
    }
    let connected = state.hub.occupancy(&room_id);
    Json(json!({ "room": room_id, "connected": connected })).into_response()
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
