//! Push gateway fan-out core
//!
//! Holds the process-local mapping {session_id → observers}. This mapping
//! is ephemeral and never an authoritative view of the session: it only
//! routes frames that the update bus (or a local write) produced to the
//! sockets attached to this instance.
//!
//! Each observer owns a bounded outbound queue. A full queue means the
//! observer cannot keep up; it is disconnected rather than allowed to grow
//! an unbounded buffer, and recovers state via resync on reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::ServerMessage;
use crate::clock::ServerClock;
use crate::metrics::Metrics;
use crate::model::SyncSession;

struct Observer {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// Handle owned by one socket task
pub struct ObserverHandle {
    pub session_id: Uuid,
    pub observer_id: u64,
    pub rx: mpsc::Receiver<String>,
}

pub struct PushGateway {
    observers: DashMap<Uuid, Vec<Observer>>,
    next_id: AtomicU64,
    buffer: usize,
    clock: Arc<ServerClock>,
    metrics: Arc<Metrics>,
}

impl PushGateway {
    pub fn new(buffer: usize, clock: Arc<ServerClock>, metrics: Arc<Metrics>) -> Self {
        Self {
            observers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            clock,
            metrics,
        }
    }

    /// Attach one observer to a session's local fan-out
    pub fn register(&self, session_id: Uuid) -> ObserverHandle {
        let (tx, rx) = mpsc::channel(self.buffer);
        let observer_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .entry(session_id)
            .or_default()
            .push(Observer { id: observer_id, tx });
        self.metrics.ws_observers.inc();
        tracing::debug!(session_id = %session_id, observer_id, "observer attached");
        ObserverHandle {
            session_id,
            observer_id,
            rx,
        }
    }

    pub fn unregister(&self, session_id: Uuid, observer_id: u64) {
        let mut removed = false;
        if let Some(mut entry) = self.observers.get_mut(&session_id) {
            let before = entry.len();
            entry.retain(|o| o.id != observer_id);
            removed = entry.len() < before;
        }
        self.observers
            .remove_if(&session_id, |_, observers| observers.is_empty());
        if removed {
            self.metrics.ws_observers.dec();
            tracing::debug!(session_id = %session_id, observer_id, "observer detached");
        }
    }

    /// Route an update notice to local observers: a full-state
    /// `STATE_UPDATE`, or `SESSION_DELETED` when the state is gone
    pub fn dispatch_update(&self, session_id: Uuid, state: Option<SyncSession>) {
        let timestamp = self.clock.now_ms();
        let message = match state {
            Some(state) => ServerMessage::StateUpdate {
                session_id,
                timestamp,
                state: Box::new(state),
            },
            None => ServerMessage::SessionDeleted {
                session_id,
                timestamp,
            },
        };
        let kind = message.kind();
        let Ok(frame) = serde_json::to_string(&message) else {
            tracing::error!(session_id = %session_id, "push frame encode failed");
            return;
        };
        self.fan_out(session_id, kind, frame);
    }

    /// Relay an opaque payload from the push channel family verbatim
    pub fn dispatch_raw(&self, session_id: Uuid, payload: String) {
        self.fan_out(session_id, "RAW", payload);
    }

    /// Observers currently attached to a session on this instance
    pub fn observer_count(&self, session_id: Uuid) -> usize {
        self.observers
            .get(&session_id)
            .map(|o| o.len())
            .unwrap_or(0)
    }

    /// Shutdown path: drop every observer. Closing the outbound channels
    /// ends each socket task, which closes its connection on the way out.
    pub fn close_all(&self) {
        let mut dropped = 0usize;
        self.observers.retain(|_, observers| {
            dropped += observers.len();
            false
        });
        for _ in 0..dropped {
            self.metrics.ws_observers.dec();
        }
        if dropped > 0 {
            tracing::info!(observers = dropped, "push gateway closed");
        }
    }

    fn fan_out(&self, session_id: Uuid, kind: &'static str, frame: String) {
        let Some(mut entry) = self.observers.get_mut(&session_id) else {
            // No local observers: the message is dropped here by design
            return;
        };

        let mut slow: Vec<u64> = Vec::new();
        for observer in entry.iter() {
            match observer.tx.try_send(frame.clone()) {
                Ok(()) => {
                    self.metrics.ws_messages_total.with_label_values(&[kind]).inc();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        session_id = %session_id,
                        observer_id = observer.id,
                        "observer outbound buffer full, disconnecting"
                    );
                    slow.push(observer.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(observer.id);
                }
            }
        }

        if !slow.is_empty() {
            let before = entry.len();
            // Dropping the sender ends the socket task's outbound stream
            entry.retain(|o| !slow.contains(&o.id));
            let dropped = before - entry.len();
            for _ in 0..dropped {
                self.metrics.ws_observers.dec();
            }
        }
    }
}
