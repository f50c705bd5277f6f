//! Transition algebra
//!
//! Pure functions from the current session state plus a transition request
//! to the next state. No I/O happens here: the caller reads the server
//! clock at a single point and passes `now` in, which keeps every branch
//! deterministic and directly testable.
//!
//! Versions are never bumped here; the store increments by exactly one on
//! each admitted write.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::rotation;
use crate::error::SyncError;
use crate::model::{
    Group, NewSession, Participant, SessionStatus, SyncMode, SyncSession, TimeoutAction,
};

/// Explicit switch target (otherwise rotation chooses)
#[derive(Debug, Clone, Default)]
pub struct NextEntity {
    pub participant_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
}

/// What folding the open cycle into the ledger concluded
struct SettleOutcome {
    /// A per-entity budget hit zero this cycle (per_participant / per_group
    /// / per_cycle)
    entity_expired: bool,
    /// The session-level pool is exhausted (global budget or count_up max)
    pool_expired: bool,
}

// ============================================================================
// Construction
// ============================================================================

/// Build the initial state: pending, version 1, everyone inactive
pub fn build_initial(spec: &NewSession, now: DateTime<Utc>) -> SyncSession {
    let participants = spec
        .participants
        .iter()
        .map(|p| {
            let initial_remaining = match spec.sync_mode {
                SyncMode::CountUp => 0,
                SyncMode::PerCycle => spec.time_per_cycle_ms.unwrap_or(p.total_time_ms),
                _ => p.total_time_ms,
            };
            Participant {
                participant_id: p.participant_id,
                participant_index: p.participant_index,
                total_time_ms: p.total_time_ms,
                time_remaining_ms: initial_remaining,
                time_used_ms: 0,
                cycle_count: 0,
                has_gone: false,
                is_active: false,
                has_expired: false,
                group_id: p.group_id,
            }
        })
        .collect();

    let groups = if spec.groups.is_empty() {
        None
    } else {
        Some(
            spec.groups
                .iter()
                .map(|g| Group {
                    group_id: g.group_id,
                    total_time_ms: g.total_time_ms,
                    time_remaining_ms: g.total_time_ms,
                    time_used_ms: 0,
                    cycle_count: 0,
                    has_expired: false,
                    is_active: false,
                    participant_ids: g.participant_ids.clone(),
                })
                .collect(),
        )
    };

    SyncSession {
        session_id: spec.session_id,
        sync_mode: spec.sync_mode,
        status: SessionStatus::Pending,
        version: 1,
        participants,
        groups,
        // Recorded now, activated on start
        active_participant_id: spec.active_participant_id,
        active_group_id: spec.active_group_id,
        total_time_ms: spec.total_time_ms,
        time_per_cycle_ms: spec.time_per_cycle_ms,
        increment_ms: spec.increment_ms,
        max_time_ms: spec.max_time_ms,
        time_used_ms: 0,
        cycle_started_at: None,
        session_started_at: None,
        session_completed_at: None,
        created_at: now,
        updated_at: now,
        timeout_action: spec.timeout_action.clone(),
        outcome: None,
        last_auto_action: None,
    }
}

// ============================================================================
// Lifecycle transitions
// ============================================================================

/// pending → running; fixes `session_started_at` and opens the first cycle
pub fn apply_start(state: &SyncSession, now: DateTime<Utc>) -> Result<SyncSession, SyncError> {
    if state.status != SessionStatus::Pending {
        return Err(SyncError::InvalidTransition {
            action: "start",
            status: state.status,
        });
    }

    let mut next = state.clone();
    match next.sync_mode {
        SyncMode::PerGroup => {
            let group_id = next
                .active_group_id
                .or_else(|| next.groups.as_ref().and_then(|gs| gs.first().map(|g| g.group_id)))
                .ok_or_else(|| SyncError::validation("groups", "per_group session has no groups"))?;
            next.activate(None, Some(group_id));
        }
        _ => {
            let participant_id = next
                .active_participant_id
                .or_else(|| rotation::first_participant(&next.participants))
                .ok_or_else(|| {
                    SyncError::validation("participants", "session has no participants")
                })?;
            reset_cycle_budget(&mut next, participant_id);
            next.activate(Some(participant_id), None);
        }
    }

    next.status = SessionStatus::Running;
    next.session_started_at = Some(now);
    next.cycle_started_at = Some(now);
    Ok(next)
}

/// running → running: the hot path. Settle the active ledger, award the
/// increment, rotate, open the next cycle.
pub fn apply_switch(
    state: &SyncSession,
    now: DateTime<Utc>,
    next_target: Option<&NextEntity>,
) -> Result<SyncSession, SyncError> {
    if state.status != SessionStatus::Running {
        return Err(SyncError::InvalidTransition {
            action: "switch",
            status: state.status,
        });
    }

    let mut next = state.clone();
    let settled = settle_active(&mut next, now)?;

    if settled.pool_expired {
        return Ok(expire_pool(next, now));
    }

    // Increment is only awarded to an entity that survived its own cycle
    if !settled.entity_expired {
        award_increment(&mut next);
    }

    match next.sync_mode {
        SyncMode::PerGroup => {
            let current = next.active_group_id.ok_or_else(|| {
                SyncError::StateCorrupt("running per_group session without active group".into())
            })?;
            let successor = match next_target.and_then(|t| t.group_id) {
                Some(explicit) => Some(validate_group_target(&next, explicit)?),
                None => {
                    let groups = next.groups.as_deref().unwrap_or(&[]);
                    rotation::next_group(groups, current, true)
                }
            };
            match successor {
                Some(group_id) => {
                    next.activate(None, Some(group_id));
                    next.cycle_started_at = Some(now);
                    Ok(next)
                }
                None => Ok(apply_timeout_policy(next, now)),
            }
        }
        _ => {
            let current = next.active_participant_id.ok_or_else(|| {
                SyncError::StateCorrupt("running session without active participant".into())
            })?;
            let skip_expired = permanent_expiry(next.sync_mode);
            let successor = match next_target.and_then(|t| t.participant_id) {
                Some(explicit) => Some(validate_participant_target(&next, explicit)?),
                None => rotation::next_participant(&next.participants, current, skip_expired),
            };
            match successor {
                Some(participant_id) => {
                    reset_cycle_budget(&mut next, participant_id);
                    next.activate(Some(participant_id), None);
                    next.cycle_started_at = Some(now);
                    Ok(next)
                }
                None => Ok(apply_timeout_policy(next, now)),
            }
        }
    }
}

/// running → paused; folds accrued time into the ledger first
pub fn apply_pause(state: &SyncSession, now: DateTime<Utc>) -> Result<SyncSession, SyncError> {
    if state.status != SessionStatus::Running {
        return Err(SyncError::InvalidTransition {
            action: "pause",
            status: state.status,
        });
    }

    let mut next = state.clone();
    settle_active(&mut next, now)?;
    // The active ids survive pause so resume knows where to pick up;
    // the is_active flags do not
    next.deactivate_all();
    next.cycle_started_at = None;
    next.status = SessionStatus::Paused;
    Ok(next)
}

/// paused → running; reopens the cycle for the remembered active entity
pub fn apply_resume(state: &SyncSession, now: DateTime<Utc>) -> Result<SyncSession, SyncError> {
    if state.status != SessionStatus::Paused {
        return Err(SyncError::InvalidTransition {
            action: "resume",
            status: state.status,
        });
    }

    let mut next = state.clone();
    next.activate(next.active_participant_id, next.active_group_id);
    next.cycle_started_at = Some(now);
    next.status = SessionStatus::Running;
    Ok(next)
}

/// Any non-completed status → completed (or cancelled when the caller says
/// so). A running ledger is settled first; a pending session completes
/// without ever having started.
pub fn apply_complete(
    state: &SyncSession,
    now: DateTime<Utc>,
    outcome: Option<String>,
) -> Result<SyncSession, SyncError> {
    if state.status == SessionStatus::Completed {
        return Err(SyncError::InvalidTransition {
            action: "complete",
            status: state.status,
        });
    }

    let mut next = state.clone();
    if next.status == SessionStatus::Running {
        settle_active(&mut next, now)?;
    }

    let cancelled = outcome.as_deref() == Some("cancelled");
    next.status = if cancelled {
        SessionStatus::Cancelled
    } else {
        SessionStatus::Completed
    };
    next.outcome = outcome.or_else(|| Some(next.status.to_string()));
    next.session_completed_at = Some(now);
    next.deactivate_all();
    next.active_participant_id = None;
    next.active_group_id = None;
    next.cycle_started_at = None;
    Ok(next)
}

/// The active entity's derived remaining hit zero: settle, then evaluate
/// the configured timeout policy. Only valid on a running session.
pub fn apply_timeout(state: &SyncSession, now: DateTime<Utc>) -> Result<SyncSession, SyncError> {
    if state.status != SessionStatus::Running {
        return Err(SyncError::InvalidTransition {
            action: "timeout",
            status: state.status,
        });
    }

    let mut next = state.clone();
    let settled = settle_active(&mut next, now)?;
    if settled.pool_expired {
        return Ok(expire_pool(next, now));
    }
    Ok(apply_timeout_policy(next, now))
}

// ============================================================================
// Derived reads (calculate, don't count)
// ============================================================================

/// Snapshot with the in-flight elapsed applied to the active ledger. Pure
/// arithmetic for display; the stored state is untouched.
pub fn derived_view(state: &SyncSession, now: DateTime<Utc>) -> SyncSession {
    let mut view = state.clone();
    let Some(started) = view.cycle_started_at else {
        return view;
    };
    if view.status != SessionStatus::Running {
        return view;
    }
    let elapsed = (now - started).num_milliseconds().max(0);

    match view.sync_mode {
        SyncMode::PerParticipant | SyncMode::PerCycle => {
            if let Some(id) = view.active_participant_id {
                if let Some(p) = view.participant_mut(id) {
                    p.time_remaining_ms = (p.time_remaining_ms - elapsed).max(0);
                }
            }
        }
        SyncMode::PerGroup => {
            if let Some(id) = view.active_group_id {
                if let Some(g) = view.group_mut(id) {
                    g.time_remaining_ms = (g.time_remaining_ms - elapsed).max(0);
                }
            }
        }
        SyncMode::Global => {
            view.time_used_ms += elapsed;
        }
        SyncMode::CountUp => {
            view.time_used_ms += elapsed;
            if let Some(id) = view.active_participant_id {
                if let Some(p) = view.participant_mut(id) {
                    p.time_used_ms += elapsed;
                }
            }
        }
    }
    view
}

/// Whether a lazy expiry transition is due for this state at `now`
pub fn expiry_due(state: &SyncSession, now: DateTime<Utc>) -> bool {
    if state.status != SessionStatus::Running {
        return false;
    }
    let Some(started) = state.cycle_started_at else {
        return false;
    };
    let elapsed = (now - started).num_milliseconds().max(0);

    match state.sync_mode {
        SyncMode::PerParticipant | SyncMode::PerCycle => state
            .active_participant_id
            .and_then(|id| state.participant(id))
            .map(|p| !p.has_expired && p.time_remaining_ms - elapsed <= 0)
            .unwrap_or(false),
        SyncMode::PerGroup => state
            .active_group_id
            .and_then(|id| state.group(id))
            .map(|g| !g.has_expired && g.time_remaining_ms - elapsed <= 0)
            .unwrap_or(false),
        SyncMode::Global => state.total_time_ms - (state.time_used_ms + elapsed) <= 0,
        SyncMode::CountUp => state
            .max_time_ms
            .map(|max| state.time_used_ms + elapsed >= max)
            .unwrap_or(false),
    }
}

// ============================================================================
// Internals
// ============================================================================

/// Expiry is permanent (excludes the entity from rotation) in the budgeted
/// per-entity modes; per_cycle gets a fresh clock every cycle
fn permanent_expiry(mode: SyncMode) -> bool {
    matches!(mode, SyncMode::PerParticipant | SyncMode::PerGroup)
}

/// Fold the open cycle into the active entity's ledger: debit remaining
/// (clamped at zero), credit used, bump the cycle count, flag expiry.
fn settle_active(state: &mut SyncSession, now: DateTime<Utc>) -> Result<SettleOutcome, SyncError> {
    let started = state.cycle_started_at.ok_or_else(|| {
        SyncError::StateCorrupt("running session without cycle_started_at".into())
    })?;
    let elapsed = (now - started).num_milliseconds().max(0);
    state.time_used_ms += elapsed;

    let mut outcome = SettleOutcome {
        entity_expired: false,
        pool_expired: false,
    };

    match state.sync_mode {
        SyncMode::PerParticipant | SyncMode::PerCycle => {
            let id = state.active_participant_id.ok_or_else(|| {
                SyncError::StateCorrupt("running session without active participant".into())
            })?;
            let p = state
                .participant_mut(id)
                .ok_or_else(|| SyncError::StateCorrupt("active participant not in list".into()))?;
            let debit = elapsed.min(p.time_remaining_ms);
            p.time_remaining_ms -= debit;
            p.time_used_ms += debit;
            p.cycle_count += 1;
            p.has_gone = true;
            if p.time_remaining_ms == 0 {
                p.has_expired = true;
                outcome.entity_expired = true;
            }
        }
        SyncMode::PerGroup => {
            let id = state.active_group_id.ok_or_else(|| {
                SyncError::StateCorrupt("running per_group session without active group".into())
            })?;
            let g = state
                .group_mut(id)
                .ok_or_else(|| SyncError::StateCorrupt("active group not in list".into()))?;
            let debit = elapsed.min(g.time_remaining_ms);
            g.time_remaining_ms -= debit;
            g.time_used_ms += debit;
            g.cycle_count += 1;
            if g.time_remaining_ms == 0 {
                g.has_expired = true;
                outcome.entity_expired = true;
            }
        }
        SyncMode::Global => {
            if let Some(id) = state.active_participant_id {
                if let Some(p) = state.participant_mut(id) {
                    p.time_used_ms += elapsed;
                    p.cycle_count += 1;
                    p.has_gone = true;
                }
            }
            outcome.pool_expired = state.session_time_remaining_ms() == 0;
        }
        SyncMode::CountUp => {
            if let Some(id) = state.active_participant_id {
                if let Some(p) = state.participant_mut(id) {
                    p.time_used_ms += elapsed;
                    p.cycle_count += 1;
                    p.has_gone = true;
                }
            }
            outcome.pool_expired = state
                .max_time_ms
                .map(|max| state.time_used_ms >= max)
                .unwrap_or(false);
        }
    }

    Ok(outcome)
}

fn award_increment(state: &mut SyncSession) {
    let Some(increment) = state.increment_ms else {
        return;
    };
    match state.sync_mode {
        SyncMode::PerParticipant => {
            if let Some(id) = state.active_participant_id {
                if let Some(p) = state.participant_mut(id) {
                    p.time_remaining_ms += increment;
                }
            }
        }
        SyncMode::PerGroup => {
            if let Some(id) = state.active_group_id {
                if let Some(g) = state.group_mut(id) {
                    g.time_remaining_ms += increment;
                }
            }
        }
        // per_cycle resets instead; global and count_up have no
        // per-entity budget to credit
        _ => {}
    }
}

/// per_cycle hands the incoming entity a fresh clock
fn reset_cycle_budget(state: &mut SyncSession, participant_id: Uuid) {
    if state.sync_mode != SyncMode::PerCycle {
        return;
    }
    let Some(per_cycle) = state.time_per_cycle_ms else {
        return;
    };
    if let Some(p) = state.participant_mut(participant_id) {
        p.time_remaining_ms = per_cycle;
        p.has_expired = false;
    }
}

fn validate_participant_target(state: &SyncSession, id: Uuid) -> Result<Uuid, SyncError> {
    let p = state
        .participant(id)
        .ok_or_else(|| SyncError::validation("next_participant_id", format!("unknown participant {id}")))?;
    if p.has_expired && permanent_expiry(state.sync_mode) {
        return Err(SyncError::InvalidTransition {
            action: "switch to expired participant",
            status: state.status,
        });
    }
    Ok(id)
}

fn validate_group_target(state: &SyncSession, id: Uuid) -> Result<Uuid, SyncError> {
    let g = state
        .group(id)
        .ok_or_else(|| SyncError::validation("next_group_id", format!("unknown group {id}")))?;
    if g.has_expired {
        return Err(SyncError::InvalidTransition {
            action: "switch to expired group",
            status: state.status,
        });
    }
    Ok(id)
}

/// The shared pool is gone (global budget or count_up ceiling): every
/// policy ends the session here, the configured outcome names the cause
fn expire_pool(mut state: SyncSession, now: DateTime<Utc>) -> SyncSession {
    let outcome = match &state.timeout_action {
        TimeoutAction::EndSession { outcome } => outcome.clone(),
        _ => "time_exhausted".to_string(),
    };
    expire_session(&mut state, now, outcome);
    state
}

/// Entity-level expiry policy once no increment can save the entity
fn apply_timeout_policy(mut state: SyncSession, now: DateTime<Utc>) -> SyncSession {
    match state.timeout_action.clone() {
        TimeoutAction::EndSession { outcome } => {
            expire_session(&mut state, now, outcome);
            state
        }
        TimeoutAction::SkipCycle => skip_or_expire(state, now),
        TimeoutAction::AutoAction { action } => {
            state.last_auto_action = Some(action);
            skip_or_expire(state, now)
        }
        TimeoutAction::Notify => {
            // Expiry is flagged on the entity; the session keeps running
            // and the clock restarts so the flag is published once
            state.cycle_started_at = Some(now);
            state
        }
    }
}

fn skip_or_expire(mut state: SyncSession, now: DateTime<Utc>) -> SyncSession {
    let successor = match state.sync_mode {
        SyncMode::PerGroup => state.active_group_id.and_then(|current| {
            let groups = state.groups.as_deref().unwrap_or(&[]);
            rotation::next_group(groups, current, true)
                .map(|id| (None, Some(id)))
        }),
        _ => state.active_participant_id.and_then(|current| {
            rotation::next_participant(&state.participants, current, permanent_expiry(state.sync_mode))
                .map(|id| (Some(id), None))
        }),
    };

    match successor {
        Some((participant_id, group_id)) => {
            if let Some(pid) = participant_id {
                reset_cycle_budget(&mut state, pid);
            }
            state.activate(participant_id, group_id);
            state.cycle_started_at = Some(now);
            state
        }
        None => {
            expire_session(&mut state, now, "timeout".to_string());
            state
        }
    }
}

fn expire_session(state: &mut SyncSession, now: DateTime<Utc>, outcome: String) {
    state.status = SessionStatus::Expired;
    state.outcome = Some(outcome);
    state.session_completed_at = Some(now);
    state.deactivate_all();
    state.active_participant_id = None;
    state.active_group_id = None;
    state.cycle_started_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewGroup, NewParticipant};
    use chrono::TimeZone;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn spec(mode: SyncMode, budgets: &[i64]) -> NewSession {
        NewSession {
            session_id: Uuid::new_v4(),
            sync_mode: mode,
            participants: budgets
                .iter()
                .enumerate()
                .map(|(i, b)| NewParticipant {
                    participant_id: Uuid::new_v4(),
                    participant_index: i as u32,
                    total_time_ms: *b,
                    group_id: None,
                })
                .collect(),
            groups: vec![],
            total_time_ms: budgets.iter().sum(),
            time_per_cycle_ms: None,
            increment_ms: None,
            max_time_ms: None,
            active_participant_id: None,
            active_group_id: None,
            timeout_action: TimeoutAction::default(),
        }
    }

    fn running(mode: SyncMode, budgets: &[i64]) -> SyncSession {
        let state = build_initial(&spec(mode, budgets), t(0));
        apply_start(&state, t(0)).expect("start")
    }

    #[test]
    fn initial_state_is_pending_and_inactive() {
        let state = build_initial(&spec(SyncMode::PerParticipant, &[300_000, 300_000]), t(0));
        assert_eq!(state.status, SessionStatus::Pending);
        assert_eq!(state.version, 1);
        assert!(state.session_started_at.is_none());
        assert!(state.participants.iter().all(|p| !p.is_active));
        assert_eq!(state.participants[0].time_remaining_ms, 300_000);
    }

    #[test]
    fn count_up_ignores_budgets() {
        let state = build_initial(&spec(SyncMode::CountUp, &[300_000]), t(0));
        assert_eq!(state.participants[0].time_remaining_ms, 0);
    }

    #[test]
    fn start_activates_lowest_index() {
        let state = running(SyncMode::PerParticipant, &[300_000, 300_000]);
        assert_eq!(state.status, SessionStatus::Running);
        assert_eq!(
            state.active_participant_id,
            Some(state.participants[0].participant_id)
        );
        assert!(state.participants[0].is_active);
        assert!(!state.participants[1].is_active);
        assert!(state.session_started_at.is_some());
        assert!(state.cycle_started_at.is_some());
    }

    #[test]
    fn start_honors_configured_initial_participant() {
        let mut s = spec(SyncMode::PerParticipant, &[300_000, 300_000]);
        s.active_participant_id = Some(s.participants[1].participant_id);
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        assert_eq!(state.active_participant_id, Some(s.participants[1].participant_id));
    }

    #[test]
    fn start_twice_is_invalid() {
        let state = running(SyncMode::PerParticipant, &[300_000]);
        let err = apply_start(&state, t(10)).expect_err("already running");
        assert!(matches!(err, SyncError::InvalidTransition { action: "start", .. }));
    }

    #[test]
    fn switch_debits_and_rotates() {
        let state = running(SyncMode::PerParticipant, &[300_000, 300_000]);
        let p1 = state.participants[0].participant_id;
        let p2 = state.participants[1].participant_id;

        let next = apply_switch(&state, t(2_000), None).expect("switch");
        let first = next.participant(p1).unwrap();
        assert_eq!(first.time_remaining_ms, 298_000);
        assert_eq!(first.time_used_ms, 2_000);
        assert_eq!(first.cycle_count, 1);
        assert!(first.has_gone);
        assert!(!first.is_active);
        assert_eq!(next.active_participant_id, Some(p2));
        assert_eq!(next.cycle_started_at, Some(t(2_000)));
        assert_eq!(next.time_used_ms, 2_000);
    }

    #[test]
    fn switch_on_pending_is_invalid() {
        let state = build_initial(&spec(SyncMode::PerParticipant, &[300_000]), t(0));
        assert!(matches!(
            apply_switch(&state, t(10), None),
            Err(SyncError::InvalidTransition { action: "switch", .. })
        ));
    }

    #[test]
    fn debit_clamps_at_zero_and_marks_expired() {
        let state = running(SyncMode::PerParticipant, &[1_000, 300_000]);
        let p1 = state.participants[0].participant_id;

        let next = apply_switch(&state, t(2_500), None).expect("switch");
        let first = next.participant(p1).unwrap();
        assert_eq!(first.time_remaining_ms, 0);
        assert!(first.has_expired);
        // Only the available budget is credited to the ledger
        assert_eq!(first.time_used_ms, 1_000);
        // Full wall time still accrues at session level
        assert_eq!(next.time_used_ms, 2_500);
    }

    #[test]
    fn exact_zero_is_expired_without_increment() {
        let mut s = spec(SyncMode::PerParticipant, &[2_000, 300_000]);
        s.increment_ms = Some(5_000);
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let p1 = state.participants[0].participant_id;

        let next = apply_switch(&state, t(2_000), None).expect("switch");
        let first = next.participant(p1).unwrap();
        assert_eq!(first.time_remaining_ms, 0, "no increment on expiry");
        assert!(first.has_expired);
    }

    #[test]
    fn increment_awarded_when_entity_survives() {
        let mut s = spec(SyncMode::PerParticipant, &[300_000, 300_000]);
        s.increment_ms = Some(5_000);
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let p1 = state.participants[0].participant_id;

        let next = apply_switch(&state, t(2_000), None).expect("switch");
        assert_eq!(next.participant(p1).unwrap().time_remaining_ms, 303_000);
    }

    #[test]
    fn switch_with_single_participant_is_a_real_cycle() {
        let state = running(SyncMode::PerParticipant, &[300_000]);
        let p1 = state.participants[0].participant_id;

        let next = apply_switch(&state, t(1_000), None).expect("switch");
        assert_eq!(next.active_participant_id, Some(p1));
        assert_eq!(next.participant(p1).unwrap().cycle_count, 1);
        assert!(next.participant(p1).unwrap().is_active);
        assert_eq!(next.status, SessionStatus::Running);
    }

    #[test]
    fn rotation_skips_expired_participants() {
        let state = running(SyncMode::PerParticipant, &[300_000, 1_000, 300_000]);
        let p3 = state.participants[2].participant_id;

        // Expire the middle participant directly
        let mut state = state;
        let mid = state.participants[1].participant_id;
        state.participant_mut(mid).unwrap().has_expired = true;

        let next = apply_switch(&state, t(2_000), None).expect("switch");
        assert_eq!(next.active_participant_id, Some(p3));
    }

    #[test]
    fn explicit_next_target_is_honored() {
        let state = running(SyncMode::PerParticipant, &[300_000, 300_000, 300_000]);
        let p3 = state.participants[2].participant_id;
        let target = NextEntity {
            participant_id: Some(p3),
            group_id: None,
        };
        let next = apply_switch(&state, t(2_000), Some(&target)).expect("switch");
        assert_eq!(next.active_participant_id, Some(p3));
    }

    #[test]
    fn unknown_next_target_is_a_validation_error() {
        let state = running(SyncMode::PerParticipant, &[300_000, 300_000]);
        let target = NextEntity {
            participant_id: Some(Uuid::new_v4()),
            group_id: None,
        };
        assert!(matches!(
            apply_switch(&state, t(2_000), Some(&target)),
            Err(SyncError::Validation { .. })
        ));
    }

    #[test]
    fn expired_explicit_target_is_invalid() {
        let mut state = running(SyncMode::PerParticipant, &[300_000, 300_000]);
        let p2 = state.participants[1].participant_id;
        state.participant_mut(p2).unwrap().has_expired = true;
        let target = NextEntity {
            participant_id: Some(p2),
            group_id: None,
        };
        assert!(matches!(
            apply_switch(&state, t(2_000), Some(&target)),
            Err(SyncError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn all_expired_ends_the_session() {
        let mut s = spec(SyncMode::PerParticipant, &[1_000, 1_000]);
        s.timeout_action = TimeoutAction::EndSession {
            outcome: "flag_fall".into(),
        };
        let mut state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let p2 = state.participants[1].participant_id;
        state.participant_mut(p2).unwrap().has_expired = true;

        // Active participant runs out with nobody left to rotate to
        let next = apply_switch(&state, t(5_000), None).expect("switch");
        assert_eq!(next.status, SessionStatus::Expired);
        assert_eq!(next.outcome.as_deref(), Some("flag_fall"));
        assert!(next.active_participant_id.is_none());
        assert!(next.participants.iter().all(|p| !p.is_active));
        assert!(next.session_completed_at.is_some());
    }

    #[test]
    fn per_cycle_resets_incoming_clock() {
        let mut s = spec(SyncMode::PerCycle, &[0, 0]);
        s.time_per_cycle_ms = Some(30_000);
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let p1 = state.participants[0].participant_id;
        let p2 = state.participants[1].participant_id;
        assert_eq!(state.participant(p1).unwrap().time_remaining_ms, 30_000);

        let next = apply_switch(&state, t(12_000), None).expect("switch");
        assert_eq!(next.participant(p1).unwrap().time_remaining_ms, 18_000);
        assert_eq!(next.participant(p2).unwrap().time_remaining_ms, 30_000);

        // Coming back around hands P1 a fresh clock
        let next = apply_switch(&next, t(20_000), None).expect("switch");
        assert_eq!(next.participant(p1).unwrap().time_remaining_ms, 30_000);
        assert!(!next.participant(p1).unwrap().has_expired);
    }

    #[test]
    fn per_cycle_expiry_does_not_block_rotation() {
        let mut s = spec(SyncMode::PerCycle, &[0, 0]);
        s.time_per_cycle_ms = Some(1_000);
        s.timeout_action = TimeoutAction::SkipCycle;
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let p1 = state.participants[0].participant_id;

        // P1 overruns its cycle; P2 takes over; P1 is admissible again
        let next = apply_switch(&state, t(3_000), None).expect("switch");
        let next = apply_switch(&next, t(3_500), None).expect("switch");
        assert_eq!(next.active_participant_id, Some(p1));
        assert_eq!(next.participant(p1).unwrap().time_remaining_ms, 1_000);
    }

    fn group_spec() -> NewSession {
        let g1 = Uuid::new_v4();
        let g2 = Uuid::new_v4();
        let mut s = spec(SyncMode::PerGroup, &[0, 0]);
        s.participants[0].group_id = Some(g1);
        s.participants[1].group_id = Some(g2);
        s.groups = vec![
            NewGroup {
                group_id: g1,
                total_time_ms: 60_000,
                participant_ids: vec![s.participants[0].participant_id],
            },
            NewGroup {
                group_id: g2,
                total_time_ms: 60_000,
                participant_ids: vec![s.participants[1].participant_id],
            },
        ];
        s
    }

    #[test]
    fn per_group_debits_the_active_group() {
        let s = group_spec();
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let g1 = s.groups[0].group_id;
        let g2 = s.groups[1].group_id;
        assert_eq!(state.active_group_id, Some(g1));
        assert!(state.active_participant_id.is_none());

        let next = apply_switch(&state, t(4_000), None).expect("switch");
        let first = next.group(g1).unwrap();
        assert_eq!(first.time_remaining_ms, 56_000);
        assert_eq!(first.cycle_count, 1);
        assert!(!first.is_active);
        assert_eq!(next.active_group_id, Some(g2));
        assert!(next.group(g2).unwrap().is_active);
    }

    #[test]
    fn global_pool_expiry_ends_the_session() {
        let mut s = spec(SyncMode::Global, &[0, 0]);
        s.total_time_ms = 10_000;
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");

        let next = apply_switch(&state, t(4_000), None).expect("switch");
        assert_eq!(next.status, SessionStatus::Running);
        assert_eq!(next.time_used_ms, 4_000);
        assert_eq!(next.session_time_remaining_ms(), 6_000);

        let done = apply_switch(&next, t(12_000), None).expect("switch");
        assert_eq!(done.status, SessionStatus::Expired);
        assert_eq!(done.outcome.as_deref(), Some("timeout"));
    }

    #[test]
    fn count_up_accrues_without_expiring_budgets() {
        let state = running(SyncMode::CountUp, &[0, 0]);
        let p1 = state.participants[0].participant_id;

        let next = apply_switch(&state, t(7_000), None).expect("switch");
        let first = next.participant(p1).unwrap();
        assert_eq!(first.time_used_ms, 7_000);
        assert!(!first.has_expired);
        assert_eq!(next.time_used_ms, 7_000);
        assert_eq!(next.status, SessionStatus::Running);
    }

    #[test]
    fn count_up_max_time_bounds_the_session() {
        let mut s = spec(SyncMode::CountUp, &[0]);
        s.max_time_ms = Some(5_000);
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");

        let done = apply_switch(&state, t(6_000), None).expect("switch");
        assert_eq!(done.status, SessionStatus::Expired);
    }

    #[test]
    fn pause_folds_ledger_and_clears_cycle() {
        let state = running(SyncMode::PerParticipant, &[300_000, 300_000]);
        let p1 = state.participants[0].participant_id;

        let paused = apply_pause(&state, t(2_000)).expect("pause");
        assert_eq!(paused.status, SessionStatus::Paused);
        assert!(paused.cycle_started_at.is_none());
        let first = paused.participant(p1).unwrap();
        assert_eq!(first.time_remaining_ms, 298_000);
        assert_eq!(first.cycle_count, 1, "pause ends the cycle");
        assert!(!first.is_active, "nobody is active while paused");
        assert_eq!(paused.active_participant_id, Some(p1), "resume target kept");
    }

    #[test]
    fn pause_does_not_award_increment() {
        let mut s = spec(SyncMode::PerParticipant, &[300_000]);
        s.increment_ms = Some(5_000);
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let p1 = state.participants[0].participant_id;

        let paused = apply_pause(&state, t(2_000)).expect("pause");
        assert_eq!(paused.participant(p1).unwrap().time_remaining_ms, 298_000);
    }

    #[test]
    fn resume_restores_the_active_entity() {
        let state = running(SyncMode::PerParticipant, &[300_000, 300_000]);
        let p1 = state.participants[0].participant_id;

        let paused = apply_pause(&state, t(2_000)).expect("pause");
        let resumed = apply_resume(&paused, t(5_000)).expect("resume");
        assert_eq!(resumed.status, SessionStatus::Running);
        assert_eq!(resumed.cycle_started_at, Some(t(5_000)));
        assert!(resumed.participant(p1).unwrap().is_active);
    }

    #[test]
    fn pause_resume_preserves_remaining_time() {
        let state = running(SyncMode::PerParticipant, &[300_000]);
        let p1 = state.participants[0].participant_id;

        let paused = apply_pause(&state, t(2_000)).expect("pause");
        let before = paused.participant(p1).unwrap().time_remaining_ms;
        // Wall time passes while paused
        let resumed = apply_resume(&paused, t(9_000)).expect("resume");
        assert_eq!(resumed.participant(p1).unwrap().time_remaining_ms, before);
    }

    #[test]
    fn resume_requires_paused() {
        let state = running(SyncMode::PerParticipant, &[300_000]);
        assert!(matches!(
            apply_resume(&state, t(10)),
            Err(SyncError::InvalidTransition { action: "resume", .. })
        ));
    }

    #[test]
    fn complete_settles_running_ledger() {
        let state = running(SyncMode::PerParticipant, &[300_000, 300_000]);
        let p1 = state.participants[0].participant_id;

        let done = apply_complete(&state, t(2_000), None).expect("complete");
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.participant(p1).unwrap().time_remaining_ms, 298_000);
        assert!(done.session_completed_at.is_some());
        assert!(done.cycle_started_at.is_none());
        assert!(done.active_participant_id.is_none());
        assert!(done.participants.iter().all(|p| !p.is_active));
    }

    #[test]
    fn complete_of_pending_session_is_accepted() {
        let state = build_initial(&spec(SyncMode::PerParticipant, &[300_000]), t(0));
        let done = apply_complete(&state, t(100), None).expect("complete");
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.session_started_at.is_none());
    }

    #[test]
    fn complete_twice_is_invalid() {
        let state = running(SyncMode::PerParticipant, &[300_000]);
        let done = apply_complete(&state, t(1_000), None).expect("complete");
        assert!(matches!(
            apply_complete(&done, t(2_000), None),
            Err(SyncError::InvalidTransition { action: "complete", .. })
        ));
    }

    #[test]
    fn cancel_outcome_yields_cancelled_status() {
        let state = running(SyncMode::PerParticipant, &[300_000]);
        let done = apply_complete(&state, t(1_000), Some("cancelled".into())).expect("complete");
        assert_eq!(done.status, SessionStatus::Cancelled);
        assert_eq!(done.outcome.as_deref(), Some("cancelled"));
    }

    #[test]
    fn timeout_skip_cycle_advances_rotation() {
        let mut s = spec(SyncMode::PerParticipant, &[1_000, 300_000]);
        s.timeout_action = TimeoutAction::SkipCycle;
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let p1 = state.participants[0].participant_id;
        let p2 = state.participants[1].participant_id;

        let next = apply_timeout(&state, t(1_500)).expect("timeout");
        assert_eq!(next.status, SessionStatus::Running);
        assert!(next.participant(p1).unwrap().has_expired);
        assert_eq!(next.active_participant_id, Some(p2));
        assert_eq!(next.cycle_started_at, Some(t(1_500)));
    }

    #[test]
    fn timeout_auto_action_records_the_action() {
        let mut s = spec(SyncMode::PerParticipant, &[1_000, 300_000]);
        s.timeout_action = TimeoutAction::AutoAction {
            action: "forfeit_move".into(),
        };
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");

        let next = apply_timeout(&state, t(1_500)).expect("timeout");
        assert_eq!(next.last_auto_action.as_deref(), Some("forfeit_move"));
        assert_eq!(next.status, SessionStatus::Running);
    }

    #[test]
    fn timeout_notify_flags_and_keeps_running() {
        let mut s = spec(SyncMode::PerParticipant, &[1_000, 300_000]);
        s.timeout_action = TimeoutAction::Notify;
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let p1 = state.participants[0].participant_id;

        let next = apply_timeout(&state, t(1_500)).expect("timeout");
        assert_eq!(next.status, SessionStatus::Running);
        assert!(next.participant(p1).unwrap().has_expired);
        assert_eq!(next.active_participant_id, Some(p1));
        // Flag is published once, no repeated expiry
        assert!(!expiry_due(&next, t(2_000)));
    }

    #[test]
    fn timeout_end_session_expires_with_outcome() {
        let mut s = spec(SyncMode::PerParticipant, &[1_000, 300_000]);
        s.timeout_action = TimeoutAction::EndSession {
            outcome: "defaulted".into(),
        };
        let state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");

        let next = apply_timeout(&state, t(1_500)).expect("timeout");
        assert_eq!(next.status, SessionStatus::Expired);
        assert_eq!(next.outcome.as_deref(), Some("defaulted"));
    }

    #[test]
    fn expiry_due_tracks_derived_remaining() {
        let state = running(SyncMode::PerParticipant, &[1_000, 300_000]);
        assert!(!expiry_due(&state, t(500)));
        assert!(expiry_due(&state, t(1_000)));
        assert!(expiry_due(&state, t(2_000)));
    }

    #[test]
    fn expiry_not_due_when_paused() {
        let state = running(SyncMode::PerParticipant, &[1_000]);
        let paused = apply_pause(&state, t(500)).expect("pause");
        assert!(!expiry_due(&paused, t(10_000)));
    }

    #[test]
    fn derived_view_subtracts_in_flight_elapsed() {
        let state = running(SyncMode::PerParticipant, &[300_000, 300_000]);
        let p1 = state.participants[0].participant_id;

        let view = derived_view(&state, t(1_200));
        assert_eq!(view.participant(p1).unwrap().time_remaining_ms, 298_800);
        // The underlying state is untouched
        assert_eq!(state.participant(p1).unwrap().time_remaining_ms, 300_000);
    }

    #[test]
    fn derived_view_clamps_below_zero() {
        let state = running(SyncMode::PerParticipant, &[1_000]);
        let view = derived_view(&state, t(5_000));
        let p1 = state.participants[0].participant_id;
        assert_eq!(view.participant(p1).unwrap().time_remaining_ms, 0);
    }

    #[test]
    fn ledger_invariant_holds_across_switches() {
        let mut s = spec(SyncMode::PerParticipant, &[10_000, 10_000]);
        s.increment_ms = Some(1_000);
        let mut state = apply_start(&build_initial(&s, t(0)), t(0)).expect("start");
        let mut awarded = 0i64;
        let mut now = 0i64;
        for _ in 0..6 {
            now += 1_500;
            state = apply_switch(&state, t(now), None).expect("switch");
            awarded += 1_000;
        }
        for p in &state.participants {
            assert!(p.time_remaining_ms >= 0);
            assert!(
                p.time_used_ms + p.time_remaining_ms <= p.total_time_ms + awarded,
                "ledger overflow: used={} remaining={}",
                p.time_used_ms,
                p.time_remaining_ms
            );
        }
    }
}
