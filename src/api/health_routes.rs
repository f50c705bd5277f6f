//! Operational probes
//!
//! `/health` is a static liveness check. `/ready` validates connectivity to
//! the hot and durable stores. `/metrics` is the Prometheus text scrape.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use super::AppState;

/// GET /health - liveness
pub async fn health() -> &'static str {
    "OK"
}

/// GET /ready - readiness: hot store round-trip plus durable store ping
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    // A get for a key that cannot exist doubles as a hot-store round-trip
    let hot_ok = state.store.get(Uuid::nil()).await.is_ok();
    let durable_ok = match &state.audit_repository {
        Some(repo) => repo.ping().await.is_ok(),
        None => true,
    };

    let status = if hot_ok && durable_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(json!({
        "status": if status == StatusCode::OK { "ready" } else { "unavailable" },
        "hot_store": hot_ok,
        "durable_store": durable_ok,
    }));
    (status, body)
}

/// GET /metrics - Prometheus text format
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
