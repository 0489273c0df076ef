use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    Extension, Json,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::registry::CreateSession;
use crate::session::{Session, SessionSummary};

use super::auth::{can_access, Identity};
use super::error::ApiError;
use super::ws_methods::{CreateSessionParams, WsEvent, WsRequest, WsResponse};
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ── Session CRUD ─────────────────────────────────────────────────

fn accessible_session(
    state: &AppState,
    identity: &Identity,
    id: &str,
) -> Result<Session, ApiError> {
    let session = state
        .registry
        .get(id)
        .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
    if !can_access(&session, identity) {
        return Err(ApiError::AccessDenied);
    }
    Ok(session)
}

pub(super) async fn session_list(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Json<Vec<SessionSummary>> {
    let owner = (!identity.admin).then_some(identity.id.as_str());
    Json(state.registry.list(owner))
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateSessionParams>,
) -> Result<(StatusCode, Json<SessionSummary>), ApiError> {
    let session = state
        .registry
        .create(CreateSession {
            cols: req.cols,
            rows: req.rows,
            title: req.title,
            project: req.project,
            owner: identity.id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(session.summary())))
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let session = accessible_session(&state, &identity, &id)?;
    Ok(Json(session.summary()))
}

#[derive(Deserialize)]
pub(super) struct UpdateSessionRequest {
    title: String,
}

pub(super) async fn session_update(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSessionRequest>,
) -> Result<Json<SessionSummary>, ApiError> {
    accessible_session(&state, &identity, &id)?;
    Ok(Json(state.registry.rename(&id, &req.title)?))
}

pub(super) async fn session_kill(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    accessible_session(&state, &identity, &id)?;
    state.registry.destroy(&id);
    Ok(StatusCode::NO_CONTENT)
}

// ── WebSocket ────────────────────────────────────────────────────

pub(super) async fn ws(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state, identity))
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_json<T: Serialize>(ws_tx: &mut WsSink, value: &T) -> Result<(), axum::Error> {
    match serde_json::to_string(value) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!("failed to serialize websocket message: {}", e);
            Ok(())
        }
    }
}

async fn handle_ws(socket: WebSocket, state: AppState, identity: Identity) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut conn = Connection::new(identity, state.registry.clone());
    tracing::debug!(conn = %conn.id(), user = %conn.identity().id, "websocket connected");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = match serde_json::from_str::<WsRequest>(&text) {
                            Ok(req) => conn.handle(&req).await,
                            Err(e) => Some(WsResponse::protocol_error(
                                "parse_error",
                                &format!("Invalid JSON request: {}.", e),
                            )),
                        };
                        if let Some(response) = response {
                            if send_json(&mut ws_tx, &response).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => conn.input(data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(conn = %conn.id(), ?e, "websocket receive error");
                        break;
                    }
                }
            }
            event = conn.next_event() => {
                if send_json(&mut ws_tx, &WsEvent::from(event)).await.is_err() {
                    break;
                }
            }
            _ = state.shutdown.cancelled() => {
                tracing::debug!(conn = %conn.id(), "websocket closing for shutdown");
                let close_frame = CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                let _ = ws_tx.flush().await;
                break;
            }
        }
    }

    tracing::debug!(conn = %conn.id(), session = ?conn.attached_session_id(), "websocket disconnected");
}
