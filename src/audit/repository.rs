//! Durable audit writes
//!
//! Two rows per event: an insert into `events` (natural key
//! `(session_id, version)` so queue redelivery cannot duplicate a logical
//! event) and an upsert on the `sessions` summary row that tolerates
//! replays and out-of-order workers.

use sqlx::types::Json;
use sqlx::PgPool;

use super::queue::AuditJob;

pub struct AuditRepository {
    pool: PgPool,
}

impl AuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write both rows for one accepted transition
    pub async fn record(&self, job: &AuditJob) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO events (session_id, version, event_kind, state, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id, version) DO NOTHING
            "#,
        )
        .bind(job.session_id)
        .bind(job.version)
        .bind(job.event_kind.to_string())
        .bind(Json(&job.state))
        .bind(job.state.updated_at)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, sync_mode, status, version, state,
                session_started_at, session_completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (session_id) DO UPDATE SET
                status = EXCLUDED.status,
                version = EXCLUDED.version,
                state = EXCLUDED.state,
                session_started_at = EXCLUDED.session_started_at,
                session_completed_at = EXCLUDED.session_completed_at,
                updated_at = EXCLUDED.updated_at
            WHERE sessions.version <= EXCLUDED.version
            "#,
        )
        .bind(job.session_id)
        .bind(job.state.sync_mode.to_string())
        .bind(job.state.status.to_string())
        .bind(job.state.version)
        .bind(Json(&job.state))
        .bind(job.state.session_started_at)
        .bind(job.state.session_completed_at)
        .bind(job.state.created_at)
        .bind(job.state.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Readiness probe
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
