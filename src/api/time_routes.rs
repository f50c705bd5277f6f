//! Server clock endpoint
//!
//! `GET /api/v1/time` is exempt from rate limiting: observers poll it to
//! reconcile client drift and must never be pushed into back-off by their
//! own sampling.

use axum::extract::State;
use axum::Json;

use super::{AppState, DataBody};
use crate::clock::TimeReading;

pub async fn server_time(State(state): State<AppState>) -> Json<DataBody<TimeReading>> {
    let started = std::time::Instant::now();
    let reading = state.clock.read();
    state
        .metrics
        .requests_total
        .with_label_values(&["server_time", "ok"])
        .inc();
    state
        .metrics
        .request_duration_seconds
        .with_label_values(&["server_time"])
        .observe(started.elapsed().as_secs_f64());
    Json(DataBody { data: reading })
}
