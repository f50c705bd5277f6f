//! HTTP error mapping
//!
//! Every engine/store error becomes a consistent
//! `{"error": {code, message, details?}}` body. Conflicts carry the
//! expected/actual versions in `details`; rate limits carry a
//! `Retry-After` header.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::SyncError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub retry_after_secs: Option<u64>,
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let (status, details, retry_after_secs) = match &err {
            SyncError::SessionNotFound(_) => (StatusCode::NOT_FOUND, None, None),
            SyncError::SessionExists(_) => (StatusCode::CONFLICT, None, None),
            SyncError::Conflict { expected, actual } => (
                StatusCode::CONFLICT,
                Some(json!({
                    "expected_version": expected,
                    "actual_version": actual,
                })),
                None,
            ),
            SyncError::InvalidTransition { .. } => (StatusCode::BAD_REQUEST, None, None),
            SyncError::Validation { field, .. } => (
                StatusCode::BAD_REQUEST,
                Some(json!({ "field": field })),
                None,
            ),
            SyncError::StoreUnavailable(_) => (StatusCode::INTERNAL_SERVER_ERROR, None, None),
            SyncError::StateCorrupt(_) => (StatusCode::INTERNAL_SERVER_ERROR, None, None),
            SyncError::RateLimited {
                retry_after_secs, ..
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                None,
                Some(*retry_after_secs),
            ),
            SyncError::Timeout => (StatusCode::INTERNAL_SERVER_ERROR, None, None),
        };
        ApiError {
            status,
            code: err.code(),
            message: err.to_string(),
            details,
            retry_after_secs,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        let body = Json(json!({ "error": error }));

        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
