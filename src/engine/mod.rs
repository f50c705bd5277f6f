//! Sync engine
//!
//! Orchestrates the transition algebra against the hot store. Every mutation
//! is a read-apply-conditional-write: the state is re-read on each attempt,
//! the transition is re-validated (the raced-in state may no longer admit
//! the request), and the write carries the observed version. Version
//! conflicts are retried a bounded number of times with jittered back-off
//! before surfacing to the caller.
//!
//! Each accepted transition is handed to the audit sink out-of-band; audit
//! failures never affect transition success.

pub mod rotation;
pub mod transitions;

pub use transitions::NextEntity;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::clock::ServerClock;
use crate::error::SyncError;
use crate::metrics::Metrics;
use crate::model::{EventKind, NewSession, SessionStatus, SyncSession};
use crate::store::SessionStore;

/// Base delay between conflict retries; a random jitter of the same order
/// is added so contending writers interleave
const RETRY_BASE_DELAY_MS: u64 = 10;

pub struct SyncEngine {
    store: Arc<dyn SessionStore>,
    clock: Arc<ServerClock>,
    metrics: Arc<Metrics>,
    audit: Option<Arc<dyn AuditSink>>,
    retry_max: u32,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clock: Arc<ServerClock>,
        metrics: Arc<Metrics>,
        audit: Option<Arc<dyn AuditSink>>,
        retry_max: u32,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            audit,
            retry_max,
        }
    }

    /// Validate config upstream; construct and store the initial state
    pub async fn create_session(&self, spec: NewSession) -> Result<SyncSession, SyncError> {
        let now = self.clock.now();
        let initial = transitions::build_initial(&spec, now);
        let stored = self.store.create(&initial).await?;
        tracing::info!(session_id = %stored.session_id, mode = ?stored.sync_mode, "session created");
        self.enqueue_audit(&stored, EventKind::Created).await;
        Ok(stored)
    }

    pub async fn start_session(&self, session_id: Uuid) -> Result<SyncSession, SyncError> {
        self.mutate(session_id, "start", |state, now| {
            Ok((transitions::apply_start(state, now)?, EventKind::Started))
        })
        .await
    }

    /// The hot path: settle, rotate (or honor the explicit target), reopen
    pub async fn switch_cycle(
        &self,
        session_id: Uuid,
        next: Option<NextEntity>,
    ) -> Result<SyncSession, SyncError> {
        self.mutate(session_id, "switch", move |state, now| {
            let applied = transitions::apply_switch(state, now, next.as_ref())?;
            let kind = if applied.status == SessionStatus::Expired {
                EventKind::Expired
            } else {
                EventKind::CycleSwitched
            };
            Ok((applied, kind))
        })
        .await
    }

    pub async fn pause_session(&self, session_id: Uuid) -> Result<SyncSession, SyncError> {
        self.mutate(session_id, "pause", |state, now| {
            Ok((transitions::apply_pause(state, now)?, EventKind::Paused))
        })
        .await
    }

    pub async fn resume_session(&self, session_id: Uuid) -> Result<SyncSession, SyncError> {
        self.mutate(session_id, "resume", |state, now| {
            Ok((transitions::apply_resume(state, now)?, EventKind::Resumed))
        })
        .await
    }

    pub async fn complete_session(
        &self,
        session_id: Uuid,
        outcome: Option<String>,
    ) -> Result<SyncSession, SyncError> {
        self.mutate(session_id, "complete", move |state, now| {
            let applied = transitions::apply_complete(state, now, outcome.clone())?;
            let kind = if applied.status == SessionStatus::Cancelled {
                EventKind::Cancelled
            } else {
                EventKind::Completed
            };
            Ok((applied, kind))
        })
        .await
    }

    /// Unconditional removal; idempotent against absent sessions
    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), SyncError> {
        let last_known = self.store.get(session_id).await?;
        self.store.delete(session_id).await?;
        tracing::info!(session_id = %session_id, "session deleted");
        if let Some(state) = last_known {
            self.enqueue_audit(&state, EventKind::Deleted).await;
        }
        Ok(())
    }

    /// Read with derived arithmetic applied. When the running entity's
    /// derived remaining has reached zero, the configured timeout action is
    /// applied as a real versioned transition before the read returns.
    pub async fn get_current_state(&self, session_id: Uuid) -> Result<SyncSession, SyncError> {
        let current = self
            .store
            .get(session_id)
            .await?
            .ok_or(SyncError::SessionNotFound(session_id))?;
        let now = self.clock.now();

        if !transitions::expiry_due(&current, now) {
            return Ok(transitions::derived_view(&current, now));
        }

        match self
            .mutate(session_id, "timeout", |state, now| {
                if !transitions::expiry_due(state, now) {
                    // A racing writer already settled this expiry
                    return Err(SyncError::InvalidTransition {
                        action: "timeout",
                        status: state.status,
                    });
                }
                Ok((transitions::apply_timeout(state, now)?, EventKind::Expired))
            })
            .await
        {
            Ok(stored) => Ok(transitions::derived_view(&stored, self.clock.now())),
            Err(SyncError::InvalidTransition { .. }) | Err(SyncError::Conflict { .. }) => {
                let fresh = self
                    .store
                    .get(session_id)
                    .await?
                    .ok_or(SyncError::SessionNotFound(session_id))?;
                Ok(transitions::derived_view(&fresh, self.clock.now()))
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn mutate<F>(
        &self,
        session_id: Uuid,
        action: &'static str,
        transition: F,
    ) -> Result<SyncSession, SyncError>
    where
        F: Fn(&SyncSession, DateTime<Utc>) -> Result<(SyncSession, EventKind), SyncError>,
    {
        let mut attempt: u32 = 0;
        loop {
            let current = self
                .store
                .get(session_id)
                .await?
                .ok_or(SyncError::SessionNotFound(session_id))?;
            let now = self.clock.now();
            let (next, kind) = transition(&current, now)?;

            match self
                .store
                .update(session_id, &next, Some(current.version))
                .await
            {
                Ok(stored) => {
                    tracing::debug!(
                        session_id = %session_id,
                        action = action,
                        version = stored.version,
                        "transition accepted"
                    );
                    self.enqueue_audit(&stored, kind).await;
                    return Ok(stored);
                }
                Err(SyncError::Conflict { expected, actual }) => {
                    self.metrics.version_conflicts_total.inc();
                    if attempt >= self.retry_max {
                        tracing::warn!(
                            session_id = %session_id,
                            action = action,
                            expected,
                            actual,
                            attempts = attempt + 1,
                            "version conflict retries exhausted"
                        );
                        return Err(SyncError::Conflict { expected, actual });
                    }
                    attempt += 1;
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn enqueue_audit(&self, state: &SyncSession, kind: EventKind) {
        if let Some(audit) = &self.audit {
            audit.enqueue_write(state.session_id, state, kind).await;
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY_MS * attempt as u64;
    let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_DELAY_MS);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewParticipant, SyncMode, TimeoutAction};
    use crate::store::InMemorySessionStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine_over(store: Arc<dyn SessionStore>) -> SyncEngine {
        SyncEngine::new(
            store,
            Arc::new(ServerClock::new(50)),
            Arc::new(Metrics::new()),
            None,
            3,
        )
    }

    fn two_player_spec(budget_ms: i64) -> NewSession {
        NewSession {
            session_id: Uuid::new_v4(),
            sync_mode: SyncMode::PerParticipant,
            participants: vec![
                NewParticipant {
                    participant_id: Uuid::new_v4(),
                    participant_index: 0,
                    total_time_ms: budget_ms,
                    group_id: None,
                },
                NewParticipant {
                    participant_id: Uuid::new_v4(),
                    participant_index: 1,
                    total_time_ms: budget_ms,
                    group_id: None,
                },
            ],
            groups: vec![],
            total_time_ms: budget_ms * 2,
            time_per_cycle_ms: None,
            increment_ms: None,
            max_time_ms: None,
            active_participant_id: None,
            active_group_id: None,
            timeout_action: TimeoutAction::default(),
        }
    }

    #[tokio::test]
    async fn versions_advance_by_one_per_mutation() {
        let store = Arc::new(InMemorySessionStore::default());
        let engine = engine_over(store);
        let spec = two_player_spec(300_000);
        let id = spec.session_id;

        let created = engine.create_session(spec).await.expect("create");
        assert_eq!(created.version, 1);
        let started = engine.start_session(id).await.expect("start");
        assert_eq!(started.version, 2);
        let switched = engine.switch_cycle(id, None).await.expect("switch");
        assert_eq!(switched.version, 3);
        let done = engine.complete_session(id, None).await.expect("complete");
        assert_eq!(done.version, 4);
    }

    /// Store wrapper that fails the first N updates with a conflict
    struct FlakyStore {
        inner: InMemorySessionStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn get(&self, id: Uuid) -> Result<Option<SyncSession>, SyncError> {
            self.inner.get(id).await
        }
        async fn create(&self, state: &SyncSession) -> Result<SyncSession, SyncError> {
            self.inner.create(state).await
        }
        async fn update(
            &self,
            id: Uuid,
            state: &SyncSession,
            expected: Option<i64>,
        ) -> Result<SyncSession, SyncError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::Conflict {
                    expected: expected.unwrap_or(0),
                    actual: expected.unwrap_or(0) + 1,
                });
            }
            self.inner.update(id, state, expected).await
        }
        async fn delete(&self, id: Uuid) -> Result<(), SyncError> {
            self.inner.delete(id).await
        }
        async fn publish_push(&self, id: Uuid, payload: &str) -> Result<(), SyncError> {
            self.inner.publish_push(id, payload).await
        }
    }

    #[tokio::test]
    async fn transient_conflicts_are_retried() {
        let store = Arc::new(FlakyStore {
            inner: InMemorySessionStore::default(),
            failures_left: AtomicU32::new(2),
        });
        let engine = engine_over(store);
        let spec = two_player_spec(300_000);
        let id = spec.session_id;
        engine.create_session(spec).await.expect("create");

        let started = engine.start_session(id).await.expect("retries succeed");
        assert_eq!(started.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn persistent_conflict_surfaces_after_retries() {
        let store = Arc::new(FlakyStore {
            inner: InMemorySessionStore::default(),
            failures_left: AtomicU32::new(u32::MAX),
        });
        let engine = engine_over(store);
        let spec = two_player_spec(300_000);
        let id = spec.session_id;
        engine.create_session(spec).await.expect("create");

        let err = engine.start_session(id).await.expect_err("exhausted");
        assert!(matches!(err, SyncError::Conflict { .. }));
    }

    #[tokio::test]
    async fn get_derives_in_flight_remaining_without_writing() {
        let store = Arc::new(InMemorySessionStore::default());
        let engine = engine_over(store);
        let spec = two_player_spec(300_000);
        let id = spec.session_id;
        let p1 = spec.participants[0].participant_id;
        engine.create_session(spec).await.expect("create");
        engine.start_session(id).await.expect("start");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let view = engine.get_current_state(id).await.expect("get");
        let remaining = view.participant(p1).unwrap().time_remaining_ms;
        assert!(
            remaining < 300_000 && remaining > 299_000,
            "derived remaining out of range: {remaining}"
        );
        assert_eq!(view.version, 2, "a plain read writes nothing");
    }

    #[tokio::test]
    async fn get_applies_lazy_expiry() {
        let store = Arc::new(InMemorySessionStore::default());
        let engine = engine_over(store);
        let mut spec = two_player_spec(50);
        spec.timeout_action = TimeoutAction::EndSession {
            outcome: "flag_fall".into(),
        };
        let id = spec.session_id;
        engine.create_session(spec).await.expect("create");
        engine.start_session(id).await.expect("start");

        tokio::time::sleep(Duration::from_millis(120)).await;
        let view = engine.get_current_state(id).await.expect("get");
        assert_eq!(view.status, SessionStatus::Expired);
        assert_eq!(view.outcome.as_deref(), Some("flag_fall"));
        assert_eq!(view.version, 3, "the expiry was a real write");
    }

    #[tokio::test]
    async fn delete_is_idempotent_through_the_engine() {
        let store = Arc::new(InMemorySessionStore::default());
        let engine = engine_over(store);
        let spec = two_player_spec(300_000);
        let id = spec.session_id;
        engine.create_session(spec).await.expect("create");

        engine.delete_session(id).await.expect("first delete");
        engine.delete_session(id).await.expect("second delete");
        let err = engine.get_current_state(id).await.expect_err("gone");
        assert!(matches!(err, SyncError::SessionNotFound(_)));
    }
}
