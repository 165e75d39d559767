use std::collections::HashSet;

use chrono_tz::Tz;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Normalize and check a participant list in place. Participant 0 becomes the
/// main reserver.
pub(crate) fn validate_participants(participants: &mut [Participant]) -> Result<(), EngineError> {
    if participants.is_empty() {
        return Err(EngineError::Validation("at least one participant is required".into()));
    }
    if participants.len() > MAX_PARTICIPANTS {
        return Err(EngineError::LimitExceeded("too many participants"));
    }

    let mut seen = HashSet::with_capacity(participants.len());
    for (i, p) in participants.iter_mut().enumerate() {
        p.id_number = p.id_number.trim().to_string();
        p.name = p.name.trim().to_string();
        for field in [&mut p.course, &mut p.year_level, &mut p.department] {
            *field = field
                .take()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
        }

        if p.id_number.is_empty() || p.name.is_empty() {
            return Err(EngineError::Validation(format!(
                "participant {i}: id number and name are required"
            )));
        }
        let too_long = [Some(&p.id_number), Some(&p.name), p.course.as_ref(), p.year_level.as_ref(), p.department.as_ref()]
            .into_iter()
            .flatten()
            .any(|v| v.len() > MAX_FIELD_LEN);
        if too_long {
            return Err(EngineError::LimitExceeded("participant field too long"));
        }

        match p.role {
            ParticipantRole::Student if p.course.is_none() || p.year_level.is_none() => {
                return Err(EngineError::Validation(format!(
                    "participant {}: students need a course and year level",
                    p.id_number
                )));
            }
            ParticipantRole::Faculty | ParticipantRole::Staff if p.department.is_none() => {
                return Err(EngineError::Validation(format!(
                    "participant {}: faculty and staff need a department",
                    p.id_number
                )));
            }
            _ => {}
        }

        if !seen.insert(p.id_number.to_lowercase()) {
            return Err(EngineError::Validation(format!(
                "duplicate participant id number {}",
                p.id_number
            )));
        }

        if i > 0 && p.is_main_reserver {
            return Err(EngineError::Validation(
                "only the first participant can be the main reserver".into(),
            ));
        }
        p.is_main_reserver = i == 0;
    }
    Ok(())
}

/// Resolve a reservation timezone, defaulting to the policy's.
pub(crate) fn resolve_timezone(requested: Option<&str>, default: Tz) -> Result<Tz, EngineError> {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| EngineError::Validation(format!("unknown timezone {name:?}"))),
        None => Ok(default),
    }
}

pub(crate) fn validate_purpose(purpose: Option<String>) -> Result<Option<String>, EngineError> {
    let purpose = purpose.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
    if purpose.as_ref().is_some_and(|p| p.len() > MAX_PURPOSE_LEN) {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    Ok(purpose)
}
