use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum SchedulingError {
    /// Malformed input: time ranges, missing or out-of-range fields.
    Validation(String),
    NotFound(Ulid),
    /// Tenant isolation violation.
    Forbidden(String),
    /// Candidate overlaps an active booking (`Some`) or a blocked/closed range (`None`).
    SlotConflict {
        booking_id: Option<Ulid>,
        reason: &'static str,
    },
    VersionConflict {
        expected: u64,
        current: u64,
    },
    IdempotencyKeyReuse(String),
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    LimitExceeded(&'static str),
    WalError(String),
    Internal(String),
}

impl SchedulingError {
    /// Expected outcomes the caller reacts to; not failures of the system.
    pub fn is_recoverable_conflict(&self) -> bool {
        matches!(
            self,
            SchedulingError::SlotConflict { .. } | SchedulingError::VersionConflict { .. }
        )
    }
}

impl std::fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingError::Validation(msg) => write!(f, "validation failed: {msg}"),
            SchedulingError::NotFound(id) => write!(f, "not found: {id}"),
            SchedulingError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            SchedulingError::SlotConflict {
                booking_id: Some(id),
                ..
            } => write!(f, "slot conflicts with booking {id}"),
            SchedulingError::SlotConflict {
                booking_id: None,
                reason,
            } => write!(f, "slot unavailable: {reason}"),
            SchedulingError::VersionConflict { expected, current } => write!(
                f,
                "version conflict: expected {expected}, current is {current}"
            ),
            SchedulingError::IdempotencyKeyReuse(key) => {
                write!(f, "idempotency key {key:?} reused with a different request")
            }
            SchedulingError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a booking in status {from}")
            }
            SchedulingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            SchedulingError::WalError(e) => write!(f, "WAL error: {e}"),
            SchedulingError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for SchedulingError {}
