//! Audit pipeline
//!
//! Records every accepted transition as a durable event, out-of-band from
//! the hot path. The queue lives in the hot store (lists plus a delayed
//! zset) so it survives process restarts; a worker pool drains it into the
//! durable store with bounded exponential-back-off retries. An exhausted
//! job lands in the failed bucket and raises an error-severity alert with
//! its full payload; transition callers are never affected.

mod queue;
mod repository;
mod worker;

pub use queue::{AuditJob, AuditQueue, QueueDepths};
pub use repository::AuditRepository;
pub use worker::AuditPipeline;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{EventKind, SyncSession};

/// Where the engine hands accepted transitions. Implementations must
/// return quickly and never propagate failure to the caller.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn enqueue_write(&self, session_id: Uuid, state: &SyncSession, event_kind: EventKind);
}
