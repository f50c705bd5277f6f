//! Session store (hot path)
//!
//! The hot store owns the authoritative view of every live session. The
//! engine never caches a session; every operation re-reads through this
//! trait. Two backends exist: redis for production and an in-memory double
//! with identical version/TTL semantics for tests.
//!
//! Writes carry the optimistic version check: a read-then-conditional-write
//! in which the stored version is compared to the caller's expectation. No
//! distributed lock is acquired; conflicts are reported, not masked. Every
//! successful mutation publishes a notice on the update channel; a publish
//! failure is logged but never rolls back the write (reconnecting observers
//! recover via resync).

mod memory_store;
mod pubsub;
mod rate_limit;
mod redis_store;

pub use memory_store::InMemorySessionStore;
pub use pubsub::spawn_update_listener;
pub use rate_limit::{InMemoryRateLimiter, LimitScope, RateLimiter, RedisRateLimiter};
pub use redis_store::RedisSessionStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::SyncSession;

/// Notice published on the update channel after every successful mutation.
/// `state: None` signals deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNotice {
    pub session_id: Uuid,
    pub state: Option<SyncSession>,
}

/// Keyed primary store of session states with optimistic versioning and TTL
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Recent consistent value, or `None` when the key is absent
    async fn get(&self, session_id: Uuid) -> Result<Option<SyncSession>, SyncError>;

    /// Store a fresh session. Refuses when the id is already taken. On
    /// success the stored copy has `version = 1` and fresh create/update
    /// timestamps, and an update notice is published.
    async fn create(&self, state: &SyncSession) -> Result<SyncSession, SyncError>;

    /// Conditional write. With `expected_version`, the write is admitted
    /// only when the stored version matches; otherwise `Conflict` carries
    /// both versions. The stored copy bumps the version by exactly 1,
    /// refreshes `updated_at` and the TTL, and a notice is published.
    async fn update(
        &self,
        session_id: Uuid,
        new_state: &SyncSession,
        expected_version: Option<i64>,
    ) -> Result<SyncSession, SyncError>;

    /// Idempotent removal; publishes a deletion notice
    async fn delete(&self, session_id: Uuid) -> Result<(), SyncError>;

    /// Tunnel an opaque payload to every instance's push gateway for the
    /// observers of one session (`ws:<id>` channel family)
    async fn publish_push(&self, session_id: Uuid, payload: &str) -> Result<(), SyncError>;
}
