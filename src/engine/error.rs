use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("conflict with reservation: {0}")]
    Conflict(Ulid),
    #[error("reservation {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("cannot delete resource {0}: has active reservations")]
    HasActiveReservations(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Failures the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }
}
