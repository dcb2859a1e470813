use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session limit exceeded for org")]
    SessionLimitExceeded,
    #[error("no runner capacity available for provider")]
    NoCapacity,
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("session already stopped: {0}")]
    SessionAlreadyStopped(Uuid),
    #[error("invalid state for requested operation")]
    InvalidState(#[from] crate::state_machine::StateMachineError),
    #[error("approval not found: {0}")]
    ApprovalNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, SessionError>;
