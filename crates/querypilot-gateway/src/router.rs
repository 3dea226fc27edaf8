use axum::routing::{get, post};
use axum::Router;

use crate::api;
use crate::state::SharedState;
use crate::ws;

/// Build the main application router with all routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .route("/api/query", post(api::query))
        .route("/api/feedback", post(api::feedback))
        .route("/api/status", get(api::status))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
