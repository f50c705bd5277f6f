//! Rotation order
//!
//! Deterministic successor selection by ascending `participant_index`
//! modulo the participant count. Expired entities are skipped in the modes
//! where expiry is permanent; when every candidate is expired there is no
//! successor and the caller evaluates the timeout policy.

use uuid::Uuid;

use crate::model::{Group, Participant};

/// Successor of `current` in rotation order. With `skip_expired`, expired
/// participants are passed over; the current participant itself is a valid
/// successor (single-participant sessions rotate back to themselves).
pub fn next_participant(
    participants: &[Participant],
    current: Uuid,
    skip_expired: bool,
) -> Option<Uuid> {
    if participants.is_empty() {
        return None;
    }
    let mut order: Vec<&Participant> = participants.iter().collect();
    order.sort_by_key(|p| p.participant_index);

    let pos = order.iter().position(|p| p.participant_id == current)?;
    let n = order.len();
    for step in 1..=n {
        let candidate = order[(pos + step) % n];
        if skip_expired && candidate.has_expired {
            continue;
        }
        return Some(candidate.participant_id);
    }
    None
}

/// Group successor in list order, same skip discipline as participants
pub fn next_group(groups: &[Group], current: Uuid, skip_expired: bool) -> Option<Uuid> {
    if groups.is_empty() {
        return None;
    }
    let pos = groups.iter().position(|g| g.group_id == current)?;
    let n = groups.len();
    for step in 1..=n {
        let candidate = &groups[(pos + step) % n];
        if skip_expired && candidate.has_expired {
            continue;
        }
        return Some(candidate.group_id);
    }
    None
}

/// First participant in rotation order (session start default)
pub fn first_participant(participants: &[Participant]) -> Option<Uuid> {
    participants
        .iter()
        .min_by_key(|p| p.participant_index)
        .map(|p| p.participant_id)
}
