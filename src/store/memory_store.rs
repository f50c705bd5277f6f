//! In-memory session store
//!
//! Test double carrying the same version, TTL, and notice semantics as the
//! redis backend, minus the transport. Update notices go out on a broadcast
//! channel that tests (and the in-process gateway) can subscribe to.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{SessionStore, UpdateNotice};
use crate::error::SyncError;
use crate::model::SyncSession;

struct Entry {
    state: SyncSession,
    expires_at: Instant,
}

/// HashMap-backed store with broadcast notices
pub struct InMemorySessionStore {
    entries: Mutex<HashMap<Uuid, Entry>>,
    ttl: Duration,
    notices: broadcast::Sender<UpdateNotice>,
    pushes: broadcast::Sender<(Uuid, String)>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        let (notices, _) = broadcast::channel(256);
        let (pushes, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            notices,
            pushes,
        }
    }

    /// Subscribe to update/delete notices (what redis delivers on
    /// `session-updates`)
    pub fn subscribe_updates(&self) -> broadcast::Receiver<UpdateNotice> {
        self.notices.subscribe()
    }

    /// Subscribe to the push channel family (what redis delivers on `ws:*`)
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<(Uuid, String)> {
        self.pushes.subscribe()
    }

    fn publish(&self, notice: UpdateNotice) {
        // No receivers is fine; delivery is best-effort like the bus
        let _ = self.notices.send(notice);
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: Uuid) -> Result<Option<SyncSession>, SyncError> {
        let mut entries = self.entries.lock().expect("store lock");
        match entries.get(&session_id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.state.clone())),
            Some(_) => {
                // Expired entries behave as absent, like a lapsed TTL
                entries.remove(&session_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn create(&self, state: &SyncSession) -> Result<SyncSession, SyncError> {
        let now = chrono::Utc::now();
        let mut stored = state.clone();
        stored.version = 1;
        stored.created_at = now;
        stored.updated_at = now;

        {
            let mut entries = self.entries.lock().expect("store lock");
            let live = entries
                .get(&state.session_id)
                .map(|e| e.expires_at > Instant::now())
                .unwrap_or(false);
            if live {
                return Err(SyncError::SessionExists(state.session_id));
            }
            entries.insert(
                state.session_id,
                Entry {
                    state: stored.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }

        self.publish(UpdateNotice {
            session_id: stored.session_id,
            state: Some(stored.clone()),
        });
        Ok(stored)
    }

    async fn update(
        &self,
        session_id: Uuid,
        new_state: &SyncSession,
        expected_version: Option<i64>,
    ) -> Result<SyncSession, SyncError> {
        let stored = {
            let mut entries = self.entries.lock().expect("store lock");
            let current = match entries.get(&session_id) {
                Some(entry) if entry.expires_at > Instant::now() => &entry.state,
                _ => return Err(SyncError::SessionNotFound(session_id)),
            };
            if let Some(expected) = expected_version {
                if current.version != expected {
                    return Err(SyncError::Conflict {
                        expected,
                        actual: current.version,
                    });
                }
            }

            let mut stored = new_state.clone();
            stored.version = new_state.version + 1;
            stored.updated_at = chrono::Utc::now();
            entries.insert(
                session_id,
                Entry {
                    state: stored.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
            stored
        };

        self.publish(UpdateNotice {
            session_id,
            state: Some(stored.clone()),
        });
        Ok(stored)
    }

    async fn delete(&self, session_id: Uuid) -> Result<(), SyncError> {
        self.entries.lock().expect("store lock").remove(&session_id);
        self.publish(UpdateNotice {
            session_id,
            state: None,
        });
        Ok(())
    }

    async fn publish_push(&self, session_id: Uuid, payload: &str) -> Result<(), SyncError> {
        let _ = self.pushes.send((session_id, payload.to_string()));
        Ok(())
    }
}
