use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::handler::build_message_handler;
use crate::state::SharedState;

/// Health and status routes plus every connector's webhook routes.
pub fn build_router(state: SharedState) -> Router {
    let connector_routes = state
        .connectors
        .router(build_message_handler(Arc::clone(&state)));

    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .with_state(state)
        .merge(connector_routes)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<SharedState>) -> axum::Json<serde_json::Value> {
    let connectors: Vec<serde_json::Value> = state
        .connectors
        .statuses()
        .into_iter()
        .map(|(name, status)| serde_json::json!({ "name": name, "status": status }))
        .collect();

    axum::Json(serde_json::json!({
        "status": "running",
        "assistant": state.assistant.name(),
        "connectors": connectors,
        "sessions": state.sessions.len(),
        "started_at": state.started_at.to_rfc3339(),
    }))
}
