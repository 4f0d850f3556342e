pub mod error;
mod handlers;

use std::future::Future;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::session::SessionRegistry;

use handlers::*;

/// Shared state handed to every handler: the explicitly constructed session
/// registry (no process-wide singleton).
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
}

/// Build the HTTP/WebSocket router.
///
/// REST endpoints cover the presentation-layer calls (create, list, stop,
/// kill, remove, clear-buffer, resize); `/ws/sessions/{id}` is the duplex
/// terminal transport.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(session_list).post(session_create))
        .route(
            "/api/sessions/{id}",
            get(session_get).delete(session_remove),
        )
        .route("/api/sessions/{id}/stop", post(session_stop))
        .route("/api/sessions/{id}/kill", post(session_kill))
        .route("/api/sessions/{id}/clear", post(session_clear))
        .route("/api/sessions/{id}/resize", post(session_resize))
        .route("/ws/sessions/{id}", get(ws_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the router until `shutdown` resolves, then shut down gracefully.
///
/// Every session is ended when the shutdown signal fires, *before* the
/// connection drain: attached WebSocket loops only exit when their session
/// ends, so draining first would wait forever on attached clients.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let sessions = state.sessions.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            sessions.cleanup_all().await;
        })
        .await
}
