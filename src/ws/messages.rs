//! Push wire protocol
//!
//! Server→client frames are tagged by `type` with camelCase payload keys;
//! `STATE_UPDATE`/`STATE_SYNC` carry the full state snapshot (observers
//! diff successive snapshots, no event granularity is exposed). The state
//! object itself keeps the REST wire schema.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::SyncSession;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "CONNECTED", rename_all = "camelCase")]
    Connected { session_id: Uuid, timestamp: i64 },

    #[serde(rename = "STATE_UPDATE", rename_all = "camelCase")]
    StateUpdate {
        session_id: Uuid,
        timestamp: i64,
        state: Box<SyncSession>,
    },

    /// Full snapshot on explicit resync; carries the same payload shape as
    /// `STATE_UPDATE`
    #[serde(rename = "STATE_SYNC", rename_all = "camelCase")]
    StateSync {
        session_id: Uuid,
        timestamp: i64,
        state: Box<SyncSession>,
    },

    #[serde(rename = "SESSION_DELETED", rename_all = "camelCase")]
    SessionDeleted { session_id: Uuid, timestamp: i64 },

    #[serde(rename = "PONG", rename_all = "camelCase")]
    Pong { session_id: Uuid, timestamp: i64 },

    /// Protocol-level failures only; transition errors are never pushed
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        session_id: Option<Uuid>,
        timestamp: i64,
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "CONNECTED",
            ServerMessage::StateUpdate { .. } => "STATE_UPDATE",
            ServerMessage::StateSync { .. } => "STATE_SYNC",
            ServerMessage::SessionDeleted { .. } => "SESSION_DELETED",
            ServerMessage::Pong { .. } => "PONG",
            ServerMessage::Error { .. } => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "RECONNECT")]
    Reconnect,
}
