use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("booking {id} is {status}, cannot {action}")]
    InvalidState {
        id: Ulid,
        status: BookingStatus,
        action: &'static str,
    },

    #[error("{actor} may not {action} booking {id}")]
    Forbidden {
        id: Ulid,
        actor: Ulid,
        action: &'static str,
    },

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Transient failures the next scheduler tick may succeed on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Storage(_))
    }
}
