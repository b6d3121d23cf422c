use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt, future};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::engine::broadcaster::BroadcastError;
use crate::engine::connection::Connection;
use crate::engine::events::{Frame, PING_LITERAL};
use crate::engine::hub::AdmissionError;
use crate::engine::write_pump::{PumpExit, run_write_pump};

use super::app_state::AppState;
use super::auth_middleware::MaybeUser;

/// Sent to a second socket that reuses a live (room, request-id) pair.
pub const DUPLICATE_CONNECTION: &str = r#"{"error":"duplicate connection"}"#;

/// How long the read side waits for the write pump to flush its close frame.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "request-id")]
    pub request_id: Option<String>,
}

/// Room ids are opaque but must be non-empty and free of `&`.
pub fn valid_room_id(room_id: &str) -> bool {
    !room_id.trim().is_empty() && !room_id.contains('&')
}

pub(super) fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// `GET /ws/{room}?request-id=...`. Bans are checked before the upgrade.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    MaybeUser(identity): MaybeUser,
) -> Response {
    if !valid_room_id(&room_id) {
        return error_json(StatusCode::BAD_REQUEST, "wrong room id");
    }
    let Some(client_id) = query.request_id.filter(|id| !id.trim().is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "missing request-id");
    };

    let user_id = identity.user_id().map(str::to_string);
    let mut subjects = vec![client_id.as_str()];
    if let Some(uid) = user_id.as_deref() {
        subjects.push(uid);
    }

    match state.hub.check_admission(&room_id, &subjects).await {
        Ok(()) => {}
        Err(AdmissionError::Banned { remaining, .. }) => {
            info!(%room_id, %client_id, "banned client refused");
            return (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "banned",
                    "remainingSeconds": remaining.map(|d| d.as_secs()),
                })),
            )
                .into_response();
        }
        Err(e) => {
            warn!(%room_id, error = %e, "admission check failed");
            return error_json(StatusCode::SERVICE_UNAVAILABLE, "try again later");
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, client_id, user_id))
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(payload) => Message::Text(payload.to_string().into()),
        Frame::Close(Some(reason)) => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(reason.as_str()),
        })),
        Frame::Close(None) => Message::Close(None),
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    room_id: String,
    client_id: String,
    user_id: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let nickname = state.nicknames.generate();

    let (conn, outlet) = match state
        .hub
        .join(&room_id, &client_id, user_id, &nickname)
        .await
    {
        Ok(joined) => joined,
        Err(e) => {
            info!(%room_id, %client_id, reason = %e, "connection refused");
            if matches!(e, AdmissionError::Duplicate(_)) {
                let _ = sender.send(Message::Text(Utf8Bytes::from_static(DUPLICATE_CONNECTION))).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    let sink = sender.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
    let mut pump = tokio::spawn(run_write_pump(sink, outlet));
    let mut pump_exit = None;

    let pause = Duration::from_millis(state.config.chat.backpressure_pause_ms);
    loop {
        tokio::select! {
            exit = &mut pump => {
                pump_exit = Some(exit.unwrap_or(PumpExit::SocketError));
                break;
            }
            frame = receiver.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(%room_id, %client_id, error = %e, "socket read failed");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => {
                        if handle_text(&state, &conn, text.as_str()).await {
                            tokio::time::sleep(pause).await;
                        }
                    }
                    Message::Close(_) => break,
                    // Binary frames are not part of the protocol; control frames are
                    // answered by axum.
                    _ => {}
                }
            }
        }
    }

    state.hub.leave(&conn);
    // Last handle: the outbound queue closes and the pump sends its close frame.
    drop(conn);

    let exit = match pump_exit {
        Some(exit) => exit,
        None => match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump).await {
            Ok(joined) => joined.unwrap_or(PumpExit::SocketError),
            Err(_) => {
                pump.abort();
                PumpExit::SocketError
            }
        },
    };

    let reason = match exit {
        PumpExit::Teardown(reason) => reason.as_str(),
        PumpExit::QueueClosed => "disconnected",
        PumpExit::SocketError => "socket error",
    };
    info!(%room_id, %client_id, reason, "connection closed");
}

/// Handle one inbound text frame. Returns true when the broadcast hit a full
/// recipient queue and the reader should back off.
async fn handle_text(state: &AppState, conn: &Connection, text: &str) -> bool {
    state.hub.ping(conn);
    if text == PING_LITERAL || text.trim().is_empty() {
        return false;
    }

    if text.len() > state.config.chat.max_message_length {
        debug!(room_id = %conn.room_id, client_id = %conn.client_id, len = text.len(), "oversized frame dropped");
        return false;
    }

    let clean = state.sanitizer.sanitize(text);
    if clean.is_empty() {
        return false;
    }

    match state.hub.send(conn, &clean).await {
        Ok(_) => false,
        Err(BroadcastError::Backpressure { dropped, .. }) => {
            debug!(room_id = %conn.room_id, dropped, "backpressure, pausing reads");
            true
        }
        Err(e) => {
            warn!(room_id = %conn.room_id, error = %e, "broadcast failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::{CloseReason, Payload};

    #[test]
    fn test_room_id_validation() {
        assert!(valid_room_id("42"));
        assert!(valid_room_id("marker-7"));
        assert!(!valid_room_id(""));
        assert!(!valid_room_id("   "));
        assert!(!valid_room_id("42&x=1"));
    }

    #[test]
    fn test_frame_mapping() {
        match to_message(Frame::Text(Payload::from("hi"))) {
            Message::Text(t) => assert_eq!(t.as_str(), "hi"),
            other => panic!("unexpected {other:?}"),
        }
        match to_message(Frame::Close(Some(CloseReason::Idle))) {
            Message::Close(Some(cf)) => {
                assert_eq!(cf.code, close_code::NORMAL);
                assert_eq!(cf.reason.as_str(), "inactive");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(to_message(Frame::Close(None)), Message::Close(None)));
    }
}
