//! Request surface
//!
//! Accepts driver requests over HTTP and translates them to engine calls,
//! with validation, rate limiting, metrics, and error mapping. Success
//! bodies wrap the session state in `{"data": <state>}`.

pub mod error;
pub mod health_routes;
pub mod session_routes;
pub mod time_routes;
pub mod validation;

pub use error::ApiError;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use crate::audit::AuditRepository;
use crate::clock::ServerClock;
use crate::config::Config;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::metrics::Metrics;
use crate::store::{RateLimiter, SessionStore};
use crate::ws::PushGateway;

/// Success envelope
#[derive(Debug, Serialize)]
pub struct DataBody<T> {
    pub data: T,
}

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub store: Arc<dyn SessionStore>,
    pub clock: Arc<ServerClock>,
    pub gateway: Arc<PushGateway>,
    pub limiter: Arc<dyn RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
    /// Absent when the durable store is not wired (tests)
    pub audit_repository: Option<Arc<AuditRepository>>,
}

impl AppState {
    /// Record the request metrics and lift the engine error onto the surface
    pub fn track<T>(
        &self,
        operation: &'static str,
        started: Instant,
        result: Result<T, SyncError>,
    ) -> Result<T, ApiError> {
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        self.metrics
            .requests_total
            .with_label_values(&[operation, status])
            .inc();
        self.metrics
            .request_duration_seconds
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
        result.map_err(ApiError::from)
    }

    /// Count a limiter rejection before it propagates
    pub fn note_rate_limited(&self, err: SyncError) -> SyncError {
        if let SyncError::RateLimited { scope, .. } = &err {
            self.metrics.rate_limited_total.with_label_values(&[scope]).inc();
        }
        err
    }
}

/// Assemble the full request surface (REST + push attach + probes)
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/sessions", post(session_routes::create_session))
        .route(
            "/api/v1/sessions/:id",
            get(session_routes::get_session).delete(session_routes::delete_session),
        )
        .route(
            "/api/v1/sessions/:id/start",
            post(session_routes::start_session),
        )
        .route(
            "/api/v1/sessions/:id/switch",
            post(session_routes::switch_cycle),
        )
        .route(
            "/api/v1/sessions/:id/pause",
            post(session_routes::pause_session),
        )
        .route(
            "/api/v1/sessions/:id/resume",
            post(session_routes::resume_session),
        )
        .route(
            "/api/v1/sessions/:id/complete",
            post(session_routes::complete_session),
        )
        .route("/api/v1/time", get(time_routes::server_time))
        .route("/ws", get(crate::ws::ws_handler))
        .route("/health", get(health_routes::health))
        .route("/ready", get(health_routes::ready))
        .route("/metrics", get(health_routes::metrics))
        .with_state(state)
}
