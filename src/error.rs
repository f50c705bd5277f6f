//! Crate-wide error types
//!
//! Every fallible operation in the engine, store, and surfaces reports one
//! of these variants. The API layer maps them onto HTTP statuses; the push
//! gateway maps protocol-level failures onto `ERROR` frames.

use thiserror::Error;
use uuid::Uuid;

use crate::model::SessionStatus;

/// Unified error for the synchronization engine and its surfaces
#[derive(Debug, Error)]
pub enum SyncError {
    /// No session stored under the given id
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    /// Create refused because the id is already taken
    #[error("session {0} already exists")]
    SessionExists(Uuid),

    /// Optimistic version check failed after retries were exhausted.
    /// Safe to retry from the caller's side.
    #[error("version conflict: expected {expected}, stored {actual}")]
    Conflict { expected: i64, actual: i64 },

    /// State machine rejected the requested transition
    #[error("cannot {action} a {status} session")]
    InvalidTransition {
        action: &'static str,
        status: SessionStatus,
    },

    /// Request shape or value range rejected before reaching the engine
    #[error("validation failed at `{field}`: {message}")]
    Validation { field: String, message: String },

    /// Hot-store transport failure; callers may retry
    #[error("hot store unavailable: {0}")]
    StoreUnavailable(String),

    /// Stored value failed to deserialize
    #[error("stored state corrupt: {0}")]
    StateCorrupt(String),

    /// A limiter budget is exhausted
    #[error("rate limited ({scope}), retry after {retry_after_secs}s")]
    RateLimited {
        scope: &'static str,
        retry_after_secs: u64,
    },

    /// An I/O deadline expired before the operation completed
    #[error("operation deadline expired")]
    Timeout,
}

impl SyncError {
    /// Short machine-readable code used in error bodies and `ERROR` frames
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SyncError::SessionExists(_) => "SESSION_EXISTS",
            SyncError::Conflict { .. } => "CONFLICT",
            SyncError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SyncError::Validation { .. } => "VALIDATION_ERROR",
            SyncError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            SyncError::StateCorrupt(_) => "STATE_CORRUPT",
            SyncError::RateLimited { .. } => "RATE_LIMITED",
            SyncError::Timeout => "TIMEOUT",
        }
    }

    /// Convenience constructor for validation failures
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        SyncError::StoreUnavailable(e.to_string())
    }
}
