use chrono::TimeZone;

use crate::config::Policy;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation("start must be before end".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// No blocking reservation on the room may overlap `span`.
pub(crate) fn check_no_overlap(
    rs: &RoomState,
    span: &Span,
    ignore: Option<ulid::Ulid>,
) -> Result<(), EngineError> {
    match rs
        .blocking_overlapping(span)
        .find(|r| Some(r.id) != ignore)
    {
        Some(r) => Err(EngineError::Overlap(r.id)),
        None => Ok(()),
    }
}

/// Upper bound for a continuous extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionCeiling {
    /// Extend up to (excluding) this instant.
    At(Ms),
    /// Nothing caps the extension.
    Unbounded,
    /// No usable time left.
    NoRoom,
}

impl ExtensionCeiling {
    pub fn instant(&self) -> Option<Ms> {
        match self {
            ExtensionCeiling::At(t) => Some(*t),
            _ => None,
        }
    }
}

/// The earliest start of a blocking reservation on the same room at or after the
/// reservation's effective end, further capped by the end of the business day.
pub fn compute_extension_ceiling(
    rs: &RoomState,
    reservation: &Reservation,
    now: Ms,
    policy: &Policy,
) -> ExtensionCeiling {
    let from = reservation.effective_end();

    // Sorted by start: skip everything starting before the effective end.
    let first = rs.reservations.partition_point(|r| r.span.start < from);
    let next_conflict = rs.reservations[first..]
        .iter()
        .find(|r| r.id != reservation.id && r.is_blocking())
        .map(|r| r.span.start);

    let ceiling = match (next_conflict, business_day_cap(reservation, from, policy)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    match ceiling {
        None => ExtensionCeiling::Unbounded,
        Some(t) if t > now && t > from => ExtensionCeiling::At(t),
        Some(_) => ExtensionCeiling::NoRoom,
    }
}

/// End of the business day on the local date of `from`, if configured.
fn business_day_cap(reservation: &Reservation, from: Ms, policy: &Policy) -> Option<Ms> {
    let end_of_day = policy.business_day_end?;
    let tz = reservation.tz();
    let date = local_date(from, tz)?;
    tz.from_local_datetime(&date.and_time(end_of_day))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}
