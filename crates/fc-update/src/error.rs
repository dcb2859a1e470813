#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("build not found: {0}")]
    BuildNotFound(String),
    #[error("no compatible result recorded for build {0}")]
    NotPromotable(String),
    #[error("rollout not found: {0}")]
    RolloutNotFound(uuid::Uuid),
    #[error("rollout is not in a state that permits this operation")]
    InvalidRolloutState,
    #[error("channel requires a passing canary result before rollout")]
    CanaryRequired,
    #[error("too many concurrent rollouts for this channel")]
    TooManyConcurrentRollouts,
    #[error("no opted-in repos for sweep")]
    NoOptedInRepos,
    #[error("too many concurrent sweeps")]
    TooManySweeps,
    #[error("upstream fetch failed: {0}")]
    FetchFailed(String),
}

pub type Result<T> = std::result::Result<T, UpdateError>;
