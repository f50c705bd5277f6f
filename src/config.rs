//! Service configuration
//!
//! All knobs come from the environment (a `.env` file is honored via
//! dotenvy). Missing variables fall back to documented defaults; malformed
//! values fail process start instead of being silently ignored.

use std::env;

use crate::error::SyncError;

/// Runtime configuration for one service instance
#[derive(Debug, Clone)]
pub struct Config {
    /// Hot store address
    pub redis_url: String,
    /// Durable store DSN
    pub database_url: String,
    pub listen_port: u16,
    /// Hot-store expiry (reset on every write)
    pub session_ttl_seconds: u64,
    /// Engine-local retry bound for optimistic version conflicts
    pub version_conflict_retry_max: u32,
    pub audit_retry_attempts: u32,
    pub audit_backoff_base_ms: u64,
    pub audit_worker_count: usize,
    pub heartbeat_interval_ms: u64,
    pub rate_limit_general_per_minute: u64,
    pub rate_limit_switch_per_second: u64,
    pub shutdown_grace_ms: u64,
    /// Namespaces every hot-store key and channel (test/tenant isolation)
    pub key_prefix: String,
    /// Deadline applied to every individual hot-store I/O
    pub store_op_timeout_ms: u64,
    pub drift_tolerance_ms: i64,
    /// Bounded per-observer outbound queue; a full queue drops the observer
    pub ws_outbound_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "postgresql://localhost:5432/turnsync".to_string(),
            listen_port: 3000,
            session_ttl_seconds: 3600,
            version_conflict_retry_max: 3,
            audit_retry_attempts: 5,
            audit_backoff_base_ms: 2000,
            audit_worker_count: 4,
            heartbeat_interval_ms: 5000,
            rate_limit_general_per_minute: 100,
            rate_limit_switch_per_second: 10,
            shutdown_grace_ms: 15_000,
            key_prefix: String::new(),
            store_op_timeout_ms: 2000,
            drift_tolerance_ms: 50,
            ws_outbound_buffer: 64,
        }
    }
}

impl Config {
    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self, SyncError> {
        let defaults = Config::default();
        Ok(Config {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            listen_port: parse_var("LISTEN_PORT", defaults.listen_port)?,
            session_ttl_seconds: parse_var("SESSION_TTL_SECONDS", defaults.session_ttl_seconds)?,
            version_conflict_retry_max: parse_var(
                "VERSION_CONFLICT_RETRY_MAX",
                defaults.version_conflict_retry_max,
            )?,
            audit_retry_attempts: parse_var("AUDIT_RETRY_ATTEMPTS", defaults.audit_retry_attempts)?,
            audit_backoff_base_ms: parse_var(
                "AUDIT_BACKOFF_BASE_MS",
                defaults.audit_backoff_base_ms,
            )?,
            audit_worker_count: parse_var("AUDIT_WORKER_COUNT", defaults.audit_worker_count)?,
            heartbeat_interval_ms: parse_var(
                "HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            rate_limit_general_per_minute: parse_var(
                "RATE_LIMIT_GENERAL_PER_MINUTE",
                defaults.rate_limit_general_per_minute,
            )?,
            rate_limit_switch_per_second: parse_var(
                "RATE_LIMIT_SWITCH_PER_SECOND",
                defaults.rate_limit_switch_per_second,
            )?,
            shutdown_grace_ms: parse_var("SHUTDOWN_GRACE_MS", defaults.shutdown_grace_ms)?,
            key_prefix: env::var("KEY_PREFIX").unwrap_or(defaults.key_prefix),
            store_op_timeout_ms: parse_var("STORE_OP_TIMEOUT_MS", defaults.store_op_timeout_ms)?,
            drift_tolerance_ms: parse_var("DRIFT_TOLERANCE_MS", defaults.drift_tolerance_ms)?,
            ws_outbound_buffer: parse_var("WS_OUTBOUND_BUFFER", defaults.ws_outbound_buffer)?,
        })
    }

    /// Hot-store key for a session state entry
    pub fn session_key(&self, session_id: uuid::Uuid) -> String {
        format!("{}session:{}", self.key_prefix, session_id)
    }

    /// Channel carrying update/delete notices for every session
    pub fn updates_channel(&self) -> String {
        format!("{}session-updates", self.key_prefix)
    }

    /// Per-session push channel (pattern family `ws:*`)
    pub fn push_channel(&self, session_id: uuid::Uuid) -> String {
        format!("{}ws:{}", self.key_prefix, session_id)
    }

    /// Pattern matching every push channel under this prefix
    pub fn push_pattern(&self) -> String {
        format!("{}ws:*", self.key_prefix)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, SyncError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| SyncError::validation(name, format!("malformed value `{raw}`"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn defaults_match_contract() {
        let c = Config::default();
        assert_eq!(c.session_ttl_seconds, 3600);
        assert_eq!(c.version_conflict_retry_max, 3);
        assert_eq!(c.audit_retry_attempts, 5);
        assert_eq!(c.audit_backoff_base_ms, 2000);
        assert_eq!(c.heartbeat_interval_ms, 5000);
        assert_eq!(c.rate_limit_general_per_minute, 100);
        assert_eq!(c.rate_limit_switch_per_second, 10);
        assert_eq!(c.shutdown_grace_ms, 15_000);
        assert!(c.key_prefix.is_empty());
    }

    #[test]
    fn key_layout_honors_prefix() {
        let mut c = Config::default();
        c.key_prefix = "test1:".to_string();
        let id = Uuid::nil();
        assert_eq!(
            c.session_key(id),
            format!("test1:session:{id}")
        );
        assert_eq!(c.updates_channel(), "test1:session-updates");
        assert_eq!(c.push_channel(id), format!("test1:ws:{id}"));
        assert_eq!(c.push_pattern(), "test1:ws:*");
    }
}
