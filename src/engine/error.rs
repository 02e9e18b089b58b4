use ulid::Ulid;

use crate::model::{BookingStatus, SlotStatus, VehicleClass};

#[derive(Debug)]
pub enum EngineError {
    /// Slot or booking id unknown.
    NotFound(Ulid),
    AlreadyExists(Ulid),
    SlotUnavailable {
        slot_id: Ulid,
        status: SlotStatus,
    },
    VehicleClassMismatch {
        slot_class: VehicleClass,
        requested: VehicleClass,
    },
    /// Overlaps the window of this pending/active booking.
    TimeConflict(Ulid),
    NotCancellable(Ulid),
    InvalidInterval(&'static str),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    /// Slot lock not acquired within the retry budget.
    Contention(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Callers may retry `Contention`; every other kind is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Contention(_))
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SlotUnavailable { .. } => "slot_unavailable",
            EngineError::VehicleClassMismatch { .. } => "vehicle_class_mismatch",
            EngineError::TimeConflict(_) => "time_conflict",
            EngineError::NotCancellable(_) => "not_cancellable",
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Contention(_) => "contention",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotUnavailable { slot_id, status } => {
                write!(f, "slot {slot_id} is not available (status: {status})")
            }
            EngineError::VehicleClassMismatch {
                slot_class,
                requested,
            } => {
                write!(f, "slot accepts {slot_class}, requested {requested}")
            }
            EngineError::TimeConflict(id) => write!(f, "time conflict with booking: {id}"),
            EngineError::NotCancellable(id) => write!(f, "booking {id} cannot be cancelled"),
            EngineError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid booking transition: {from} -> {to}")
            }
            EngineError::Contention(id) => {
                write!(f, "slot {id} is busy, retry later")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
