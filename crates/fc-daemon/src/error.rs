//! Maps the domain error enums from each control-plane crate onto HTTP
//! responses in the `fc_api_types::Envelope` shape, the way `at-bridge`'s
//! `ApiError` maps its own errors onto `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fc_api_types::Envelope;
use fc_fleet::FleetError;
use fc_session::SessionError;
use fc_update::UpdateError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Session(SessionError::SessionNotFound(_)) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            ApiError::Session(SessionError::ApprovalNotFound(_)) => (StatusCode::NOT_FOUND, "APPROVAL_NOT_FOUND"),
            ApiError::Session(SessionError::SessionLimitExceeded) => (StatusCode::CONFLICT, "SESSION_LIMIT_EXCEEDED"),
            ApiError::Session(SessionError::NoCapacity) => (StatusCode::SERVICE_UNAVAILABLE, "NO_CAPACITY"),
            ApiError::Session(SessionError::SessionAlreadyStopped(_)) => {
                (StatusCode::CONFLICT, "SESSION_ALREADY_STOPPED")
            }
            ApiError::Session(SessionError::InvalidState(_)) => (StatusCode::CONFLICT, "INVALID_STATE"),
            ApiError::Fleet(FleetError::RunnerNotFound(_)) => (StatusCode::NOT_FOUND, "RUNNER_NOT_FOUND"),
            ApiError::Fleet(FleetError::RunnerLimitExceeded) => (StatusCode::CONFLICT, "RUNNER_LIMIT_EXCEEDED"),
            ApiError::Fleet(FleetError::RunnerHasActiveSessions(_)) => {
                (StatusCode::CONFLICT, "RUNNER_HAS_ACTIVE_SESSIONS")
            }
            ApiError::Update(UpdateError::BuildNotFound(_)) => (StatusCode::NOT_FOUND, "BUILD_NOT_FOUND"),
            ApiError::Update(UpdateError::RolloutNotFound(_)) => (StatusCode::NOT_FOUND, "ROLLOUT_NOT_FOUND"),
            ApiError::Update(UpdateError::NotPromotable(_)) => (StatusCode::CONFLICT, "NOT_PROMOTABLE"),
            ApiError::Update(UpdateError::InvalidRolloutState) => (StatusCode::CONFLICT, "INVALID_ROLLOUT_STATE"),
            ApiError::Update(UpdateError::CanaryRequired) => (StatusCode::CONFLICT, "CANARY_REQUIRED"),
            ApiError::Update(UpdateError::TooManyConcurrentRollouts) => {
                (StatusCode::CONFLICT, "TOO_MANY_CONCURRENT_ROLLOUTS")
            }
            ApiError::Update(UpdateError::NoOptedInRepos) => (StatusCode::BAD_REQUEST, "NO_OPTED_IN_REPOS"),
            ApiError::Update(UpdateError::TooManySweeps) => (StatusCode::CONFLICT, "TOO_MANY_SWEEPS"),
            ApiError::Update(UpdateError::FetchFailed(_)) => (StatusCode::BAD_GATEWAY, "FETCH_FAILED"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body: Envelope<()> = Envelope::err(code, self.to_string());
        (status, Json(body)).into_response()
    }
}
