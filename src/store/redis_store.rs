//! Redis-backed session store
//!
//! Values are stored as JSON under `{prefix}session:<uuid>` with the
//! inactivity TTL reset on every write. Create uses `SET NX EX` so that id
//! collisions are refused atomically. Update is the optimistic conditional
//! write: the stored version is compared to the caller's expectation and
//! the value replaced in one atomic server-side script, so two writers
//! racing on the same observed version produce exactly one winner — the
//! loser gets `Conflict`, never a silent clobber.
//!
//! Every I/O is bounded by the configured store deadline; an elapsed
//! deadline surfaces `Timeout`, transport failures surface
//! `StoreUnavailable`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::{SessionStore, UpdateNotice};
use crate::config::Config;
use crate::error::SyncError;
use crate::model::SyncSession;

/// Compare-and-set executed atomically on the server. KEYS[1] is the
/// session key; ARGV[1] the expected version ("" skips the check), ARGV[2]
/// the new payload, ARGV[3] the TTL in seconds. Replies `{status, actual}`.
const CAS_UPDATE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
  return {'missing', ''}
end
if ARGV[1] ~= '' then
  local state = cjson.decode(current)
  local actual = tostring(state['version'])
  if actual ~= ARGV[1] then
    return {'conflict', actual}
  end
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
return {'ok', ''}
"#;

pub struct RedisSessionStore {
    conn: ConnectionManager,
    config: Arc<Config>,
    op_timeout: Duration,
    cas_update: Script,
}

impl RedisSessionStore {
    /// Open a managed connection to the hot store
    pub async fn connect(config: Arc<Config>) -> Result<Self, SyncError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let op_timeout = Duration::from_millis(config.store_op_timeout_ms);
        Ok(Self {
            conn,
            config,
            op_timeout,
            cas_update: Script::new(CAS_UPDATE_SCRIPT),
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    fn encode(state: &SyncSession) -> Result<String, SyncError> {
        serde_json::to_string(state).map_err(|e| SyncError::StateCorrupt(e.to_string()))
    }

    fn decode(raw: &str) -> Result<SyncSession, SyncError> {
        serde_json::from_str(raw).map_err(|e| SyncError::StateCorrupt(e.to_string()))
    }

    /// Publish an update notice. A failure here never rolls back the write
    /// that produced it; observers recover via resync.
    async fn publish_notice(&self, session_id: Uuid, state: Option<&SyncSession>) {
        let notice = UpdateNotice {
            session_id,
            state: state.cloned(),
        };
        let payload = match serde_json::to_string(&notice) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "notice encode failed");
                return;
            }
        };
        let mut conn = self.conn.clone();
        let channel = self.config.updates_channel();
        let result: Result<i64, SyncError> =
            self.bounded(conn.publish(channel, payload)).await;
        if let Err(e) = result {
            tracing::warn!(session_id = %session_id, error = %e, "update notice publish failed");
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, session_id: Uuid) -> Result<Option<SyncSession>, SyncError> {
        let mut conn = self.conn.clone();
        let key = self.config.session_key(session_id);
        let raw: Option<String> = self.bounded(conn.get(&key)).await?;
        match raw {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, state: &SyncSession) -> Result<SyncSession, SyncError> {
        let now = chrono::Utc::now();
        let mut stored = state.clone();
        stored.version = 1;
        stored.created_at = now;
        stored.updated_at = now;

        let payload = Self::encode(&stored)?;
        let key = self.config.session_key(stored.session_id);
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key)
            .arg(&payload)
            .arg("NX")
            .arg("EX")
            .arg(self.config.session_ttl_seconds);
        let admitted: Option<String> = self.bounded(cmd.query_async(&mut conn)).await?;
        if admitted.is_none() {
            return Err(SyncError::SessionExists(stored.session_id));
        }

        self.publish_notice(stored.session_id, Some(&stored)).await;
        Ok(stored)
    }

    async fn update(
        &self,
        session_id: Uuid,
        new_state: &SyncSession,
        expected_version: Option<i64>,
    ) -> Result<SyncSession, SyncError> {
        let key = self.config.session_key(session_id);
        let mut conn = self.conn.clone();

        let mut stored = new_state.clone();
        stored.version = new_state.version + 1;
        stored.updated_at = chrono::Utc::now();
        let payload = Self::encode(&stored)?;
        let expected_arg = expected_version.map(|v| v.to_string()).unwrap_or_default();

        let reply: Vec<String> = self
            .bounded(
                self.cas_update
                    .key(&key)
                    .arg(&expected_arg)
                    .arg(&payload)
                    .arg(self.config.session_ttl_seconds)
                    .invoke_async(&mut conn),
            )
            .await?;

        match reply.first().map(String::as_str) {
            Some("ok") => {}
            Some("missing") => return Err(SyncError::SessionNotFound(session_id)),
            Some("conflict") => {
                let actual = reply
                    .get(1)
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(0);
                return Err(SyncError::Conflict {
                    expected: expected_version.unwrap_or(0),
                    actual,
                });
            }
            _ => {
                return Err(SyncError::StateCorrupt(
                    "unexpected compare-and-set reply".into(),
                ))
            }
        }

        self.publish_notice(session_id, Some(&stored)).await;
        Ok(stored)
    }

    async fn delete(&self, session_id: Uuid) -> Result<(), SyncError> {
        let key = self.config.session_key(session_id);
        let mut conn = self.conn.clone();
        let _: i64 = self.bounded(conn.del(&key)).await?;
        self.publish_notice(session_id, None).await;
        Ok(())
    }

    async fn publish_push(&self, session_id: Uuid, payload: &str) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        let channel = self.config.push_channel(session_id);
        let _: i64 = self.bounded(conn.publish(channel, payload)).await?;
        Ok(())
    }
}
