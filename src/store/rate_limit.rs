//! Request rate limiting
//!
//! Fixed-window counters keyed in the hot store so every instance draws on
//! the same budget: a per-caller window on the general surface and a tighter
//! per-session window on the switch hot path. A hot-store failure fails
//! open — availability of the surface outranks limiter strictness.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::config::Config;
use crate::error::SyncError;

/// Which limiter bucket a request draws from
#[derive(Debug, Clone)]
pub enum LimitScope {
    /// Per-caller (source identity, typically IP), per minute
    General { caller: String },
    /// Per-session on the switch transition, per second
    Switch { session_id: Uuid },
}

impl LimitScope {
    fn name(&self) -> &'static str {
        match self {
            LimitScope::General { .. } => "general",
            LimitScope::Switch { .. } => "switch",
        }
    }
}

/// Shared-budget limiter over windowed counters
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit or reject one request against the scope's window
    async fn check(&self, scope: LimitScope) -> Result<(), SyncError>;
}

// ============================================================================
// Redis-backed limiter
// ============================================================================

pub struct RedisRateLimiter {
    conn: ConnectionManager,
    key_prefix: String,
    general_per_minute: u64,
    switch_per_second: u64,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager, config: &Config) -> Self {
        Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            general_per_minute: config.rate_limit_general_per_minute,
            switch_per_second: config.rate_limit_switch_per_second,
        }
    }

    /// (key, limit, window seconds, seconds until the window turns over)
    fn window(&self, scope: &LimitScope, now_ms: i64) -> (String, u64, u64, u64) {
        match scope {
            LimitScope::General { caller } => {
                let window = now_ms / 60_000;
                let key = format!("{}ratelimit:general:{}:{}", self.key_prefix, caller, window);
                let remaining = 60 - ((now_ms / 1000) % 60) as u64;
                (key, self.general_per_minute, 120, remaining.max(1))
            }
            LimitScope::Switch { session_id } => {
                let window = now_ms / 1000;
                let key = format!("{}ratelimit:switch:{}:{}", self.key_prefix, session_id, window);
                (key, self.switch_per_second, 2, 1)
            }
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, scope: LimitScope) -> Result<(), SyncError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (key, limit, expiry, retry_after) = self.window(&scope, now_ms);
        let mut conn = self.conn.clone();

        let count: u64 = match conn.incr(&key, 1u64).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, scope = scope.name(), "limiter store error, admitting");
                return Ok(());
            }
        };
        if count == 1 {
            let _: Result<bool, _> = conn.expire(&key, expiry as i64).await;
        }

        if count > limit {
            return Err(SyncError::RateLimited {
                scope: scope.name(),
                retry_after_secs: retry_after,
            });
        }
        Ok(())
    }
}

// ============================================================================
// In-memory limiter (tests, single-instance runs)
// ============================================================================

pub struct InMemoryRateLimiter {
    counters: Mutex<HashMap<String, (u64, std::time::Instant)>>,
    general_per_minute: u64,
    switch_per_second: u64,
}

impl InMemoryRateLimiter {
    pub fn new(general_per_minute: u64, switch_per_second: u64) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            general_per_minute,
            switch_per_second,
        }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, scope: LimitScope) -> Result<(), SyncError> {
        let (key, limit, window, retry_after) = match &scope {
            LimitScope::General { caller } => (
                format!("general:{caller}"),
                self.general_per_minute,
                Duration::from_secs(60),
                60,
            ),
            LimitScope::Switch { session_id } => (
                format!("switch:{session_id}"),
                self.switch_per_second,
                Duration::from_secs(1),
                1,
            ),
        };

        let mut counters = self.counters.lock().expect("limiter lock");
        let now = std::time::Instant::now();
        let entry = counters.entry(key).or_insert((0, now));
        if now.duration_since(entry.1) >= window {
            *entry = (0, now);
        }
        entry.0 += 1;

        if entry.0 > limit {
            return Err(SyncError::RateLimited {
                scope: scope.name(),
                retry_after_secs: retry_after,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_the_limit() {
        let limiter = InMemoryRateLimiter::new(3, 10);
        for _ in 0..3 {
            limiter
                .check(LimitScope::General {
                    caller: "10.0.0.1".into(),
                })
                .await
                .expect("within budget");
        }
        let err = limiter
            .check(LimitScope::General {
                caller: "10.0.0.1".into(),
            })
            .await
            .expect_err("over budget");
        assert!(matches!(err, SyncError::RateLimited { scope: "general", .. }));
    }

    #[tokio::test]
    async fn budgets_are_per_caller() {
        let limiter = InMemoryRateLimiter::new(1, 10);
        limiter
            .check(LimitScope::General {
                caller: "10.0.0.1".into(),
            })
            .await
            .expect("first caller");
        limiter
            .check(LimitScope::General {
                caller: "10.0.0.2".into(),
            })
            .await
            .expect("second caller has its own window");
    }

    #[tokio::test]
    async fn switch_window_is_per_session() {
        let limiter = InMemoryRateLimiter::new(100, 2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for _ in 0..2 {
            limiter
                .check(LimitScope::Switch { session_id: a })
                .await
                .expect("session a budget");
        }
        assert!(limiter
            .check(LimitScope::Switch { session_id: a })
            .await
            .is_err());
        limiter
            .check(LimitScope::Switch { session_id: b })
            .await
            .expect("session b unaffected");
    }

    #[tokio::test]
    async fn window_turnover_resets_the_budget() {
        let limiter = InMemoryRateLimiter::new(100, 1);
        let id = Uuid::new_v4();
        limiter
            .check(LimitScope::Switch { session_id: id })
            .await
            .expect("first");
        assert!(limiter
            .check(LimitScope::Switch { session_id: id })
            .await
            .is_err());
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        limiter
            .check(LimitScope::Switch { session_id: id })
            .await
            .expect("fresh window");
    }
}
