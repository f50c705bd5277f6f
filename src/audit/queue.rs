//! Restart-surviving job queue over hot-store keys
//!
//! Layout under `{prefix}audit:`:
//! - `waiting` (list): admitted jobs, LPUSH/BRPOPLPUSH
//! - `active` (list): jobs currently held by a worker
//! - `delayed` (zset): retry candidates scored by due-time (epoch ms)
//! - `failed` (list): jobs whose retries are exhausted
//! - `completed` (counter): total successfully written jobs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuditSink;
use crate::config::Config;
use crate::error::SyncError;
use crate::model::{EventKind, SyncSession};

/// One queued audit record: self-describing so a post-mortem can replay it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditJob {
    pub job_id: Uuid,
    pub session_id: Uuid,
    pub version: i64,
    pub event_kind: EventKind,
    pub state: SyncSession,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Snapshot of the queue, exported as gauges
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepths {
    pub waiting: i64,
    pub active: i64,
    pub delayed: i64,
    pub failed: i64,
    pub completed: i64,
}

pub struct AuditQueue {
    conn: ConnectionManager,
    waiting_key: String,
    active_key: String,
    delayed_key: String,
    failed_key: String,
    completed_key: String,
}

impl AuditQueue {
    pub fn new(conn: ConnectionManager, config: &Config) -> Self {
        let prefix = format!("{}audit:", config.key_prefix);
        Self {
            conn,
            waiting_key: format!("{prefix}waiting"),
            active_key: format!("{prefix}active"),
            delayed_key: format!("{prefix}delayed"),
            failed_key: format!("{prefix}failed"),
            completed_key: format!("{prefix}completed"),
        }
    }

    /// Blocking pop into the active list; `None` on timeout tick
    pub async fn fetch(&self, timeout_secs: usize) -> Result<Option<String>, SyncError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .brpoplpush(&self.waiting_key, &self.active_key, timeout_secs as f64)
            .await?;
        Ok(payload)
    }

    /// Job written durably: drop it from active, count it
    pub async fn ack(&self, payload: &str) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lrem(&self.active_key, 1, payload).await?;
        let _: i64 = conn.incr(&self.completed_key, 1).await?;
        Ok(())
    }

    /// Schedule a retry: the reworked job lands in the delayed zset and the
    /// held copy leaves active
    pub async fn retry_later(
        &self,
        held_payload: &str,
        job: &AuditJob,
        due_at_ms: i64,
    ) -> Result<(), SyncError> {
        let reworked =
            serde_json::to_string(job).map_err(|e| SyncError::StateCorrupt(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(&self.delayed_key, reworked, due_at_ms).await?;
        let _: i64 = conn.lrem(&self.active_key, 1, held_payload).await?;
        Ok(())
    }

    /// Retries exhausted: retain the job for post-mortem
    pub async fn fail(&self, held_payload: &str, job: &AuditJob) -> Result<(), SyncError> {
        let terminal = serde_json::to_string(job)
            .unwrap_or_else(|_| held_payload.to_string());
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(&self.failed_key, terminal).await?;
        let _: i64 = conn.lrem(&self.active_key, 1, held_payload).await?;
        Ok(())
    }

    /// Park a payload that cannot even be decoded; the raw bytes are kept
    /// for post-mortem
    pub async fn park_raw(&self, held_payload: &str) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(&self.failed_key, held_payload).await?;
        let _: i64 = conn.lrem(&self.active_key, 1, held_payload).await?;
        Ok(())
    }

    /// Move every due delayed job back onto the waiting list; returns the
    /// number promoted
    pub async fn promote_due(&self, now_ms: i64) -> Result<usize, SyncError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(&self.delayed_key, "-inf", now_ms, 0, 100)
            .await?;
        for payload in &due {
            let removed: i64 = conn.zrem(&self.delayed_key, payload).await?;
            if removed > 0 {
                let _: i64 = conn.lpush(&self.waiting_key, payload).await?;
            }
        }
        Ok(due.len())
    }

    pub async fn depths(&self) -> Result<QueueDepths, SyncError> {
        let mut conn = self.conn.clone();
        let waiting: i64 = conn.llen(&self.waiting_key).await?;
        let active: i64 = conn.llen(&self.active_key).await?;
        let delayed: i64 = conn.zcard(&self.delayed_key).await?;
        let failed: i64 = conn.llen(&self.failed_key).await?;
        let completed: i64 = conn.get::<_, Option<i64>>(&self.completed_key).await?.unwrap_or(0);
        Ok(QueueDepths {
            waiting,
            active,
            delayed,
            failed,
            completed,
        })
    }
}

#[async_trait]
impl AuditSink for AuditQueue {
    async fn enqueue_write(&self, session_id: Uuid, state: &SyncSession, event_kind: EventKind) {
        let job = AuditJob {
            job_id: Uuid::new_v4(),
            session_id,
            version: state.version,
            event_kind,
            state: state.clone(),
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        let payload = match serde_json::to_string(&job) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "audit job encode failed");
                return;
            }
        };
        // Bounded loss beats blocking a transition on queue pressure
        let mut conn = self.conn.clone();
        if let Err(e) = conn.lpush::<_, _, i64>(&self.waiting_key, payload).await {
            tracing::error!(
                session_id = %session_id,
                version = state.version,
                event_kind = %event_kind,
                error = %e,
                "audit enqueue failed, record dropped"
            );
        }
    }
}

/// Exponential back-off for the nth retry (1-based): base · 2^(n−1)
pub(crate) fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_ms(2000, 1), 2_000);
        assert_eq!(backoff_ms(2000, 2), 4_000);
        assert_eq!(backoff_ms(2000, 3), 8_000);
        assert_eq!(backoff_ms(2000, 4), 16_000);
        assert_eq!(backoff_ms(2000, 5), 32_000);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let huge = backoff_ms(u64::MAX / 2, 40);
        assert!(huge >= u64::MAX / 2);
    }

    #[test]
    fn job_round_trips_through_json() {
        use crate::model::{SessionStatus, SyncMode, TimeoutAction};
        let state = SyncSession {
            session_id: Uuid::new_v4(),
            sync_mode: SyncMode::Global,
            status: SessionStatus::Running,
            version: 7,
            participants: vec![],
            groups: None,
            active_participant_id: None,
            active_group_id: None,
            total_time_ms: 1_000,
            time_per_cycle_ms: None,
            increment_ms: None,
            max_time_ms: None,
            time_used_ms: 0,
            cycle_started_at: None,
            session_started_at: None,
            session_completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            timeout_action: TimeoutAction::Notify,
            outcome: None,
            last_auto_action: None,
        };
        let job = AuditJob {
            job_id: Uuid::new_v4(),
            session_id: state.session_id,
            version: 7,
            event_kind: EventKind::CycleSwitched,
            state,
            enqueued_at: Utc::now(),
            attempts: 2,
        };
        let json = serde_json::to_string(&job).expect("serialize");
        let back: AuditJob = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.version, 7);
        assert_eq!(back.attempts, 2);
        assert_eq!(back.event_kind, EventKind::CycleSwitched);
    }
}
