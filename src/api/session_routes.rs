//! Session transition endpoints
//!
//! - `POST   /api/v1/sessions` - Create session (201)
//! - `GET    /api/v1/sessions/:id` - Current state with derived arithmetic
//! - `POST   /api/v1/sessions/:id/start` - pending → running
//! - `POST   /api/v1/sessions/:id/switch` - settle + rotate (hot path)
//! - `POST   /api/v1/sessions/:id/pause` - running → paused
//! - `POST   /api/v1/sessions/:id/resume` - paused → running
//! - `POST   /api/v1/sessions/:id/complete` - close out (or cancel)
//! - `DELETE /api/v1/sessions/:id` - idempotent removal (204)

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use super::error::ApiError;
use super::validation;
use super::{AppState, DataBody};
use crate::error::SyncError;
use crate::model::{SyncMode, SyncSession, TimeoutAction};
use crate::store::LimitScope;

// =============================================================================
// REQUEST TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub sync_mode: SyncMode,
    pub participants: Vec<ParticipantRequest>,
    pub total_time_ms: i64,
    #[serde(default)]
    pub time_per_cycle_ms: Option<i64>,
    #[serde(default)]
    pub increment_ms: Option<i64>,
    #[serde(default)]
    pub max_time_ms: Option<i64>,
    #[serde(default)]
    pub groups: Option<Vec<GroupRequest>>,
    #[serde(default)]
    pub active_participant_id: Option<String>,
    #[serde(default)]
    pub active_group_id: Option<String>,
    #[serde(default)]
    pub action_on_timeout: Option<TimeoutAction>,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantRequest {
    pub participant_id: String,
    pub participant_index: u32,
    pub total_time_ms: i64,
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GroupRequest {
    pub group_id: String,
    pub total_time_ms: i64,
    #[serde(default)]
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SwitchRequest {
    #[serde(default)]
    pub next_participant_id: Option<String>,
    #[serde(default)]
    pub next_group_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub outcome: Option<String>,
}

// =============================================================================
// ROUTE HANDLERS
// =============================================================================

/// POST /api/v1/sessions
pub async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    let result = async {
        general_limit(&state, &addr).await?;
        let spec = validation::validate_create(&req)?;
        state.engine.create_session(spec).await
    }
    .await;
    let stored = state.track("create_session", started, result)?;
    Ok((StatusCode::CREATED, Json(DataBody { data: stored })))
}

/// POST /api/v1/sessions/:id/start
pub async fn start_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
) -> Result<Json<DataBody<SyncSession>>, ApiError> {
    let started = Instant::now();
    let result = async {
        general_limit(&state, &addr).await?;
        state.engine.start_session(id).await
    }
    .await;
    let stored = state.track("start_session", started, result)?;
    Ok(Json(DataBody { data: stored }))
}

/// POST /api/v1/sessions/:id/switch - the hot path, additionally bounded by
/// the per-session limiter shared across instances
pub async fn switch_cycle(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
    body: Option<Json<SwitchRequest>>,
) -> Result<Json<DataBody<SyncSession>>, ApiError> {
    let started = Instant::now();
    let result = async {
        general_limit(&state, &addr).await?;
        state
            .limiter
            .check(LimitScope::Switch { session_id: id })
            .await
            .map_err(|e| state.note_rate_limited(e))?;
        let req = body.map(|Json(b)| b).unwrap_or_default();
        let next = validation::validate_switch(&req)?;
        let target = if next.participant_id.is_none() && next.group_id.is_none() {
            None
        } else {
            Some(next)
        };
        state.engine.switch_cycle(id, target).await
    }
    .await;
    let stored = state.track("switch_cycle", started, result)?;
    Ok(Json(DataBody { data: stored }))
}

/// POST /api/v1/sessions/:id/pause
pub async fn pause_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
) -> Result<Json<DataBody<SyncSession>>, ApiError> {
    let started = Instant::now();
    let result = async {
        general_limit(&state, &addr).await?;
        state.engine.pause_session(id).await
    }
    .await;
    let stored = state.track("pause_session", started, result)?;
    Ok(Json(DataBody { data: stored }))
}

/// POST /api/v1/sessions/:id/resume
pub async fn resume_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
) -> Result<Json<DataBody<SyncSession>>, ApiError> {
    let started = Instant::now();
    let result = async {
        general_limit(&state, &addr).await?;
        state.engine.resume_session(id).await
    }
    .await;
    let stored = state.track("resume_session", started, result)?;
    Ok(Json(DataBody { data: stored }))
}

/// POST /api/v1/sessions/:id/complete - `{"outcome": "cancelled"}` cancels
pub async fn complete_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
    body: Option<Json<CompleteRequest>>,
) -> Result<Json<DataBody<SyncSession>>, ApiError> {
    let started = Instant::now();
    let result = async {
        general_limit(&state, &addr).await?;
        let outcome = body.and_then(|Json(b)| b.outcome);
        state.engine.complete_session(id, outcome).await
    }
    .await;
    let stored = state.track("complete_session", started, result)?;
    Ok(Json(DataBody { data: stored }))
}

/// DELETE /api/v1/sessions/:id - 204 whether or not the session existed
pub async fn delete_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let started = Instant::now();
    let result = async {
        general_limit(&state, &addr).await?;
        state.engine.delete_session(id).await
    }
    .await;
    state.track("delete_session", started, result)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
) -> Result<Json<DataBody<SyncSession>>, ApiError> {
    let started = Instant::now();
    let result = async {
        general_limit(&state, &addr).await?;
        state.engine.get_current_state(id).await
    }
    .await;
    let stored = state.track("get_session", started, result)?;
    Ok(Json(DataBody { data: stored }))
}

async fn general_limit(state: &AppState, addr: &SocketAddr) -> Result<(), SyncError> {
    state
        .limiter
        .check(LimitScope::General {
            caller: addr.ip().to_string(),
        })
        .await
        .map_err(|e| state.note_rate_limited(e))
}
