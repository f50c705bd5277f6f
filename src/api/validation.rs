//! Request validation
//!
//! Declarative checks over the deserialized request bodies, run before the
//! engine is called. Every failure names the offending field path and a
//! human message. Shape errors (wrong JSON types, unknown enum variants)
//! are rejected earlier by deserialization.

use std::collections::HashSet;

use uuid::Uuid;

use super::session_routes::{CreateSessionRequest, SwitchRequest};
use crate::engine::NextEntity;
use crate::error::SyncError;
use crate::model::{NewGroup, NewParticipant, NewSession, SyncMode, TimeoutAction};

pub fn parse_uuid(field: &str, raw: &str) -> Result<Uuid, SyncError> {
    raw.parse::<Uuid>()
        .map_err(|_| SyncError::validation(field, format!("`{raw}` is not a UUID")))
}

fn non_negative(field: &str, value: i64) -> Result<(), SyncError> {
    if value < 0 {
        return Err(SyncError::validation(field, "must not be negative"));
    }
    Ok(())
}

fn positive(field: &str, value: i64) -> Result<(), SyncError> {
    if value <= 0 {
        return Err(SyncError::validation(field, "must be positive"));
    }
    Ok(())
}

/// Validate the create body and lower it into the engine's descriptor
pub fn validate_create(req: &CreateSessionRequest) -> Result<NewSession, SyncError> {
    let session_id = parse_uuid("session_id", &req.session_id)?;

    if req.participants.is_empty() {
        return Err(SyncError::validation("participants", "at least one participant required"));
    }
    non_negative("total_time_ms", req.total_time_ms)?;
    if let Some(v) = req.time_per_cycle_ms {
        positive("time_per_cycle_ms", v)?;
    }
    if let Some(v) = req.increment_ms {
        non_negative("increment_ms", v)?;
    }
    if let Some(v) = req.max_time_ms {
        positive("max_time_ms", v)?;
    }
    if req.sync_mode == SyncMode::Global {
        positive("total_time_ms", req.total_time_ms)?;
    }

    // Groups first so participant membership can be checked against them
    let mut groups = Vec::new();
    let mut group_ids = HashSet::new();
    if let Some(raw_groups) = &req.groups {
        for (i, g) in raw_groups.iter().enumerate() {
            let field = format!("groups[{i}].group_id");
            let group_id = parse_uuid(&field, &g.group_id)?;
            if !group_ids.insert(group_id) {
                return Err(SyncError::validation(field, "duplicate group_id"));
            }
            non_negative(&format!("groups[{i}].total_time_ms"), g.total_time_ms)?;
            let mut participant_ids = Vec::new();
            for (j, raw) in g.participant_ids.iter().enumerate() {
                participant_ids.push(parse_uuid(
                    &format!("groups[{i}].participant_ids[{j}]"),
                    raw,
                )?);
            }
            groups.push(NewGroup {
                group_id,
                total_time_ms: g.total_time_ms,
                participant_ids,
            });
        }
    }
    if req.sync_mode == SyncMode::PerGroup && groups.is_empty() {
        return Err(SyncError::validation("groups", "per_group mode requires groups"));
    }

    let mut participants = Vec::new();
    let mut seen_ids = HashSet::new();
    let mut seen_indices = HashSet::new();
    for (i, p) in req.participants.iter().enumerate() {
        let id_field = format!("participants[{i}].participant_id");
        let participant_id = parse_uuid(&id_field, &p.participant_id)?;
        if !seen_ids.insert(participant_id) {
            return Err(SyncError::validation(id_field, "duplicate participant_id"));
        }
        if !seen_indices.insert(p.participant_index) {
            return Err(SyncError::validation(
                format!("participants[{i}].participant_index"),
                "duplicate participant_index",
            ));
        }
        non_negative(&format!("participants[{i}].total_time_ms"), p.total_time_ms)?;

        let group_id = match &p.group_id {
            Some(raw) => {
                let field = format!("participants[{i}].group_id");
                let id = parse_uuid(&field, raw)?;
                if !group_ids.contains(&id) {
                    return Err(SyncError::validation(field, "references an unknown group"));
                }
                Some(id)
            }
            None => None,
        };

        participants.push(NewParticipant {
            participant_id,
            participant_index: p.participant_index,
            total_time_ms: p.total_time_ms,
            group_id,
        });
    }

    let active_participant_id = match &req.active_participant_id {
        Some(raw) => {
            let id = parse_uuid("active_participant_id", raw)?;
            if !seen_ids.contains(&id) {
                return Err(SyncError::validation(
                    "active_participant_id",
                    "references an unknown participant",
                ));
            }
            Some(id)
        }
        None => None,
    };
    let active_group_id = match &req.active_group_id {
        Some(raw) => {
            let id = parse_uuid("active_group_id", raw)?;
            if !group_ids.contains(&id) {
                return Err(SyncError::validation(
                    "active_group_id",
                    "references an unknown group",
                ));
            }
            Some(id)
        }
        None => None,
    };

    Ok(NewSession {
        session_id,
        sync_mode: req.sync_mode,
        participants,
        groups,
        total_time_ms: req.total_time_ms,
        time_per_cycle_ms: req.time_per_cycle_ms,
        increment_ms: req.increment_ms,
        max_time_ms: req.max_time_ms,
        active_participant_id,
        active_group_id,
        timeout_action: req
            .action_on_timeout
            .clone()
            .unwrap_or_else(TimeoutAction::default),
    })
}

/// Lower the optional switch body into an explicit target
pub fn validate_switch(req: &SwitchRequest) -> Result<NextEntity, SyncError> {
    let participant_id = match &req.next_participant_id {
        Some(raw) => Some(parse_uuid("next_participant_id", raw)?),
        None => None,
    };
    let group_id = match &req.next_group_id {
        Some(raw) => Some(parse_uuid("next_group_id", raw)?),
        None => None,
    };
    if participant_id.is_some() && group_id.is_some() {
        return Err(SyncError::validation(
            "next_group_id",
            "supply next_participant_id or next_group_id, not both",
        ));
    }
    Ok(NextEntity {
        participant_id,
        group_id,
    })
}
