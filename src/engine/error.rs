use ulid::Ulid;

use crate::model::{ExtensionStatus, Ms, ReservationStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The operation's precondition on the current status failed.
    InvalidStateTransition {
        id: Ulid,
        operation: &'static str,
        status: ReservationStatus,
        extension: ExtensionStatus,
    },
    Forbidden(&'static str),
    NoExtensionAvailable(Ulid),
    Validation(String),
    /// Optimistic version check lost.
    Conflict {
        id: Ulid,
        expected: u64,
        actual: u64,
    },
    /// A blocking reservation already occupies part of the requested span.
    Overlap(Ulid),
    RoomInactive(Ulid),
    OutsideWindow {
        opens_at: Ms,
        closes_at: Ms,
        now: Ms,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported at the wire boundary.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::InvalidStateTransition { .. } => "55000",
            EngineError::Forbidden(_) => "42501",
            EngineError::NoExtensionAvailable(_) => "P0003",
            EngineError::Validation(_) => "22023",
            EngineError::Conflict { .. } => "40001",
            EngineError::Overlap(_) => "23P01",
            EngineError::RoomInactive(_) => "55006",
            EngineError::OutsideWindow { .. } => "P0004",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidStateTransition {
                id,
                operation,
                status,
                extension,
            } => write!(
                f,
                "cannot {operation} reservation {id}: status is {status}, extension is {extension}"
            ),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::NoExtensionAvailable(id) => {
                write!(f, "no time available to extend reservation {id}")
            }
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::Conflict {
                id,
                expected,
                actual,
            } => write!(
                f,
                "reservation {id} changed concurrently: expected version {expected}, found {actual}"
            ),
            EngineError::Overlap(id) => write!(f, "overlaps reservation: {id}"),
            EngineError::RoomInactive(id) => write!(f, "room is not bookable: {id}"),
            EngineError::OutsideWindow {
                opens_at,
                closes_at,
                now,
            } => write!(
                f,
                "outside the allowed window [{opens_at}, {closes_at}) at {now}"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
