use ulid::Ulid;

use crate::model::{BookingStatus, OccupancyType, ProgramKey, SlotKey};

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request. Not retried.
    InvalidArgument,
    /// Refresh state and pick again.
    NotFound,
    /// Pick a different slot or occupancy type.
    FailedPrecondition,
    /// Slot is full.
    ResourceExhausted,
    Unauthorized,
    Unauthenticated,
    /// Store failure. Safe to retry with a request id.
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidArgument(String),
    ProgramNotFound(ProgramKey),
    SlotNotFound(SlotKey),
    BookingNotFound(Ulid),
    GrantNotFound { user_id: String, program_id: String },
    ProgramExists(ProgramKey),
    SlotExists(SlotKey),
    /// Group reservation on a program with no group size.
    CapacityUnconfigured(ProgramKey),
    /// Slot already holds occupants of another type.
    LockConflict {
        locked_for: OccupancyType,
        requested: OccupancyType,
    },
    SlotFull {
        booked_count: u32,
        max_cap: u32,
    },
    /// Program still has occupied slots.
    ProgramOccupied(ProgramKey),
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    LimitExceeded(&'static str),
    Unauthorized,
    Unauthenticated,
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument(_) | EngineError::LimitExceeded(_) => {
                ErrorKind::InvalidArgument
            }
            EngineError::ProgramNotFound(_)
            | EngineError::SlotNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::GrantNotFound { .. } => ErrorKind::NotFound,
            EngineError::ProgramExists(_)
            | EngineError::SlotExists(_)
            | EngineError::CapacityUnconfigured(_)
            | EngineError::LockConflict { .. }
            | EngineError::ProgramOccupied(_)
            | EngineError::InvalidTransition { .. } => ErrorKind::FailedPrecondition,
            EngineError::SlotFull { .. } => ErrorKind::ResourceExhausted,
            EngineError::Unauthorized => ErrorKind::Unauthorized,
            EngineError::Unauthenticated => ErrorKind::Unauthenticated,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::ProgramNotFound(_) => "program_not_found",
            EngineError::SlotNotFound(_) => "slot_not_found",
            EngineError::BookingNotFound(_) => "booking_not_found",
            EngineError::GrantNotFound { .. } => "grant_not_found",
            EngineError::ProgramExists(_) => "program_exists",
            EngineError::SlotExists(_) => "slot_exists",
            EngineError::CapacityUnconfigured(_) => "capacity_unconfigured",
            EngineError::LockConflict { .. } => "lock_conflict",
            EngineError::SlotFull { .. } => "slot_full",
            EngineError::ProgramOccupied(_) => "program_occupied",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Unauthorized => "unauthorized",
            EngineError::Unauthenticated => "unauthenticated",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::ProgramNotFound(key) => write!(f, "program not found: {key}"),
            EngineError::SlotNotFound(key) => write!(f, "slot not found: {key}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::GrantNotFound { user_id, program_id } => {
                write!(f, "no access grant for user {user_id} on {program_id}")
            }
            EngineError::ProgramExists(key) => write!(f, "program already exists: {key}"),
            EngineError::SlotExists(key) => write!(f, "slot already exists: {key}"),
            EngineError::CapacityUnconfigured(key) => {
                write!(f, "group capacity not configured for {key}")
            }
            EngineError::LockConflict {
                locked_for,
                requested,
            } => write!(
                f,
                "slot unavailable: locked for {locked_for} bookings, requested {requested}"
            ),
            EngineError::SlotFull {
                booked_count,
                max_cap,
            } => write!(f, "slot unavailable: full ({booked_count}/{max_cap})"),
            EngineError::ProgramOccupied(key) => {
                write!(f, "program {key} still has booked slots")
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id} cannot move from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unauthorized => write!(f, "unauthorized"),
            EngineError::Unauthenticated => write!(f, "unauthenticated"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
