use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("runner not found: {0}")]
    RunnerNotFound(Uuid),
    #[error("runner limit exceeded")]
    RunnerLimitExceeded,
    #[error("runner has active sessions: {0}")]
    RunnerHasActiveSessions(Uuid),
}

pub type Result<T> = std::result::Result<T, FleetError>;
