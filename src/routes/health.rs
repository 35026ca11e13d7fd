//! Liveness endpoint.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// GET /health: process and store liveness.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.gateway().healthy().await;
    Json(serde_json::json!({
        "status": if database { "ok" } else { "degraded" },
        "database": database,
    }))
}
