use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::fanout::OutputEvent;
use crate::session::{Session, SessionInfo};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

fn get_session(state: &AppState, id: &str) -> Result<Session, ApiError> {
    state
        .sessions
        .get(id)
        .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))
}

#[derive(Deserialize)]
pub(super) struct CreateSessionRequest {
    pub project: String,
    #[serde(default = "default_session_name")]
    pub name: String,
}

fn default_session_name() -> String {
    "shell".to_string()
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    if req.project.is_empty() {
        return Err(ApiError::InvalidRequest("project must not be empty".into()));
    }
    let session = state
        .sessions
        .create(&req.project, &req.name)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "session create failed");
            ApiError::SessionCreateFailed(e.to_string())
        })?;
    Ok((StatusCode::CREATED, Json(session.info())))
}

#[derive(Deserialize)]
pub(super) struct ListParams {
    pub project: Option<String>,
}

pub(super) async fn session_list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<SessionInfo>> {
    let sessions = state.sessions.list(params.project.as_deref());
    // Refresh liveness so the listing reflects children that exited on
    // their own.
    for session in &sessions {
        session.check_alive();
    }
    let mut infos: Vec<SessionInfo> = sessions.iter().map(Session::info).collect();
    infos.sort_by(|a, b| a.created_at_unix.cmp(&b.created_at_unix));
    Json(infos)
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = get_session(&state, &id)?;
    session.check_alive();
    Ok(Json(session.info()))
}

pub(super) async fn session_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = get_session(&state, &id)?;
    state.sessions.stop(&id);
    Ok(Json(session.info()))
}

pub(super) async fn session_kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = get_session(&state, &id)?;
    state.sessions.kill(&id).await;
    Ok(Json(session.info()))
}

pub(super) async fn session_remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.remove(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(id))
    }
}

pub(super) async fn session_clear(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.clear_buffer(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(id))
    }
}

#[derive(Deserialize)]
pub(super) struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Serialize)]
pub(super) struct ResizeResponse {
    pub resized: bool,
}

pub(super) async fn session_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<Json<ResizeResponse>, ApiError> {
    if req.rows == 0 || req.cols == 0 {
        return Err(ApiError::InvalidRequest("rows and cols must be nonzero".into()));
    }
    get_session(&state, &id)?;
    let resized = state.sessions.resize(&id, req.rows, req.cols);
    Ok(Json(ResizeResponse { resized }))
}

// ── WebSocket transport ────────────────────────────────────────────

/// In-band control message sent as a JSON text frame by terminal clients
/// (e.g. xterm.js fit addon). Anything that doesn't parse as this is
/// treated as keyboard input.
#[derive(Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    rows: u16,
    #[serde(default)]
    cols: u16,
}

fn parse_resize(text: &str) -> Option<(u16, u16)> {
    if !text.starts_with('{') {
        return None;
    }
    let msg: ControlMessage = serde_json::from_str(text).ok()?;
    (msg.kind == "resize" && msg.rows > 0 && msg.cols > 0).then_some((msg.rows, msg.cols))
}

pub(super) async fn ws_session(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_session(socket, state, id))
}

/// The duplex terminal loop for one attached client.
///
/// `Session::subscribe` returns the replay snapshot taken atomically with
/// the subscription, so the client sees the buffered history followed by
/// exactly the chunks published after it attached — nothing missed, nothing
/// duplicated.
async fn handle_ws_session(socket: WebSocket, state: AppState, id: String) {
    let Some(session) = state.sessions.get(&id) else {
        let (mut ws_tx, _) = socket.split();
        let _ = ws_tx
            .send(Message::text("\r\n[session not found]\r\n"))
            .await;
        let _ = ws_tx.close().await;
        return;
    };

    let (mut sub, snapshot) = session.subscribe();

    let (mut ws_tx, mut ws_rx) = socket.split();

    if !snapshot.is_empty() && ws_tx.send(Message::binary(snapshot)).await.is_err() {
        session.unsubscribe(sub.id);
        return;
    }

    loop {
        tokio::select! {
            // Session output -> client.
            event = sub.recv() => {
                match event {
                    Some(OutputEvent::Data(data)) => {
                        if ws_tx.send(Message::binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(OutputEvent::Closed) | None => {
                        let close_frame = CloseFrame {
                            code: axum::extract::ws::close_code::NORMAL,
                            reason: "session ended".into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                        break;
                    }
                }
            }

            // Client input -> session, serialized by the per-session write
            // lock (held for the whole message inside `Session::write`).
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some((rows, cols)) = parse_resize(&text) {
                            session.resize(rows, cols);
                        } else {
                            session.write(text.as_bytes()).await;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        session.write(&data).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled by axum
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Idempotent; the session itself keeps running after a detach.
    session.unsubscribe(sub.id);
}
