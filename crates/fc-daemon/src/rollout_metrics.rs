//! Adapter satisfying `fc_update::RolloutMetricsSource` by querying the
//! Session Coordinator. Lives here rather than in `fc-session` so that crate
//! never has to depend back on `fc-update`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fc_core::types::SessionState;
use fc_session::SessionCoordinator;
use fc_update::RolloutMetrics;

pub struct SessionCoordinatorMetricsSource {
    sessions: Arc<SessionCoordinator>,
}

impl SessionCoordinatorMetricsSource {
    pub fn new(sessions: Arc<SessionCoordinator>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl fc_update::RolloutMetricsSource for SessionCoordinatorMetricsSource {
    /// Sessions don't carry a build attribution field (a session is started
    /// against a provider, not a specific runner build), so this aggregates
    /// across all sessions started since the rollout stage began rather than
    /// filtering by `target_build_id`. Good enough for the failure-rate gate;
    /// not a substitute for a real per-build session index.
    async fn metrics_for(&self, _target_build_id: &str, since: DateTime<Utc>) -> RolloutMetrics {
        let sessions = self.sessions.list(None).await;
        let mut sessions_started = 0u64;
        let mut failures = 0u64;
        for session in sessions.iter().filter(|s| s.started_at >= since) {
            sessions_started += 1;
            if matches!(session.state, SessionState::Failed | SessionState::TimedOut) {
                failures += 1;
            }
        }
        RolloutMetrics { sessions_started, failures, disconnects: 0 }
    }
}
