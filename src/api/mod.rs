pub mod auth;
pub mod error;
mod handlers;
pub mod ws_methods;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::registry::SessionRegistry;

use auth::TokenTable;
use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    /// Cancelled when the server begins shutting down; open WebSockets
    /// send a close frame and end.
    pub shutdown: CancellationToken,
    pub tokens: Arc<TokenTable>,
}

pub fn router(state: AppState) -> Router {
    let tokens = state.tokens.clone();
    let protected = Router::new()
        .route("/sessions", get(session_list).post(session_create))
        .route(
            "/sessions/{id}",
            get(session_get).patch(session_update).delete(session_kill),
        )
        .route("/ws", get(ws))
        .layer(axum::middleware::from_fn(move |req, next| {
            let t = tokens.clone();
            async move { auth::require_auth(t, req, next).await }
        }))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
}
