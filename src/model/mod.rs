//! Session state model
//!
//! The session is the single hot-store entity: a closed tagged variant over
//! `sync_mode` and `status` with per-participant (and optionally per-group)
//! time ledgers. All durations are integer milliseconds; all timestamps are
//! ISO-8601 UTC on the wire. Unknown enum variants are rejected on
//! deserialization so that cross-instance decoding is deterministic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Mode / Status / Timeout policy
// ============================================================================

/// How time is budgeted and debited across the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Chess-style: each participant owns an independent budget
    PerParticipant,
    /// Per-turn countdown: the active entity's clock resets every cycle
    PerCycle,
    /// Team budgets: the active group's ledger is debited
    PerGroup,
    /// One shared session budget (exam timer)
    Global,
    /// Count-up stopwatch: budgets ignored, `max_time_ms` bounds the session
    CountUp,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncMode::PerParticipant => "per_participant",
            SyncMode::PerCycle => "per_cycle",
            SyncMode::PerGroup => "per_group",
            SyncMode::Global => "global",
            SyncMode::CountUp => "count_up",
        };
        f.write_str(s)
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Expired,
}

impl SessionStatus {
    /// Terminal states admit no further transitions except delete
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Expired
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Policy evaluated when the active entity's remaining time reaches zero
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Mark the entity expired and advance rotation past it
    SkipCycle,
    /// End the whole session with the given outcome
    EndSession { outcome: String },
    /// Like skip, but record the triggered action in the published state
    AutoAction { action: String },
    /// Flag the expiry and keep the session running unchanged
    Notify,
}

impl Default for TimeoutAction {
    fn default() -> Self {
        TimeoutAction::EndSession {
            outcome: "timeout".to_string(),
        }
    }
}

// ============================================================================
// Participants and groups
// ============================================================================

/// A participant's time ledger within the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: Uuid,
    /// Rotation order; unique and ascending within the session
    pub participant_index: u32,
    /// Original budget in milliseconds (ignored in count_up mode)
    pub total_time_ms: i64,
    /// Remaining budget as of the last settle
    pub time_remaining_ms: i64,
    /// Wall time debited from this ledger so far
    pub time_used_ms: i64,
    /// Completed cycles (a pause ends a cycle too)
    pub cycle_count: u32,
    pub has_gone: bool,
    pub is_active: bool,
    pub has_expired: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group_id: Option<Uuid>,
}

/// A group's shared time ledger (per_group mode)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub group_id: Uuid,
    pub total_time_ms: i64,
    pub time_remaining_ms: i64,
    pub time_used_ms: i64,
    pub cycle_count: u32,
    pub has_expired: bool,
    pub is_active: bool,
    pub participant_ids: Vec<Uuid>,
}

// ============================================================================
// Session
// ============================================================================

/// The unit of synchronization: participants, ledgers, and lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub session_id: Uuid,
    pub sync_mode: SyncMode,
    pub status: SessionStatus,
    /// Monotonically increasing write sequence; the store bumps it by
    /// exactly 1 on every successful mutation
    pub version: i64,
    pub participants: Vec<Participant>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub groups: Option<Vec<Group>>,
    pub active_participant_id: Option<Uuid>,
    pub active_group_id: Option<Uuid>,
    /// Session-level budget (shared pool in global mode)
    pub total_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub time_per_cycle_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub increment_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_time_ms: Option<i64>,
    /// Wall time accrued across all cycles (drives global / count_up expiry)
    pub time_used_ms: i64,
    pub cycle_started_at: Option<DateTime<Utc>>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeout_action: TimeoutAction,
    /// Outcome recorded on completion, cancellation, or expiry
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outcome: Option<String>,
    /// Last `auto_action` payload triggered by a timeout, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_auto_action: Option<String>,
}

impl SyncSession {
    pub fn participant(&self, id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.participant_id == id)
    }

    pub fn participant_mut(&mut self, id: Uuid) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.participant_id == id)
    }

    pub fn group(&self, id: Uuid) -> Option<&Group> {
        self.groups
            .as_ref()
            .and_then(|gs| gs.iter().find(|g| g.group_id == id))
    }

    pub fn group_mut(&mut self, id: Uuid) -> Option<&mut Group> {
        self.groups
            .as_mut()
            .and_then(|gs| gs.iter_mut().find(|g| g.group_id == id))
    }

    /// Remaining shared budget in global mode
    pub fn session_time_remaining_ms(&self) -> i64 {
        (self.total_time_ms - self.time_used_ms).max(0)
    }

    /// Clear every active flag (pause, complete, delete paths)
    pub fn deactivate_all(&mut self) {
        for p in &mut self.participants {
            p.is_active = false;
        }
        if let Some(groups) = &mut self.groups {
            for g in groups {
                g.is_active = false;
            }
        }
    }

    /// Mark exactly one entity active, clearing all others
    pub fn activate(&mut self, participant_id: Option<Uuid>, group_id: Option<Uuid>) {
        self.deactivate_all();
        self.active_participant_id = participant_id;
        self.active_group_id = group_id;
        if let Some(id) = participant_id {
            if let Some(p) = self.participant_mut(id) {
                p.is_active = true;
            }
        }
        if let Some(id) = group_id {
            if let Some(g) = self.group_mut(id) {
                g.is_active = true;
            }
        }
    }
}

// ============================================================================
// Session construction descriptor
// ============================================================================

/// Validated inputs for building a fresh session (status pending, version 1)
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: Uuid,
    pub sync_mode: SyncMode,
    pub participants: Vec<NewParticipant>,
    pub groups: Vec<NewGroup>,
    pub total_time_ms: i64,
    pub time_per_cycle_ms: Option<i64>,
    pub increment_ms: Option<i64>,
    pub max_time_ms: Option<i64>,
    /// Entity to activate on start instead of rotation position 0
    pub active_participant_id: Option<Uuid>,
    pub active_group_id: Option<Uuid>,
    pub timeout_action: TimeoutAction,
}

#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub participant_id: Uuid,
    pub participant_index: u32,
    pub total_time_ms: i64,
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub group_id: Uuid,
    pub total_time_ms: i64,
    pub participant_ids: Vec<Uuid>,
}

/// Kinds of accepted transitions, recorded on the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Started,
    CycleSwitched,
    Paused,
    Resumed,
    Completed,
    Cancelled,
    Expired,
    Deleted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::CycleSwitched => "cycle_switched",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}
