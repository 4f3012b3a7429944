use ulid::Ulid;

use crate::model::{BookingStatus, OccupantRef, Span};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("interval {span} conflicts with {occupant}")]
    Conflict { span: Span, occupant: OccupantRef },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("{actor} is not allowed to {action}")]
    Unauthorized { actor: String, action: &'static str },
    #[error("booking {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("hold {0} has expired")]
    HoldExpired(Ulid),
    #[error("timed out waiting for the reservation section")]
    Timeout,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl EngineError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::HoldExpired(_) => "hold_expired",
            EngineError::Timeout => "timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "storage",
        }
    }

    /// Whether the same request may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout | EngineError::Storage(_))
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
