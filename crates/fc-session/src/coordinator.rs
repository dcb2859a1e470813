use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fc_core::config::SessionConfig;
use fc_core::types::{
    ApprovalAction, ApprovalDecision, ApprovalRequest, CompletionSource, ProviderId, RepoRef, Session,
    SessionState, Usage,
};
use fc_fleet::FleetManager;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::approval;
use crate::error::{Result, SessionError};
use crate::state_machine::{SessionEvent, SessionStateMachine};

struct Entry {
    session: Session,
    sm: SessionStateMachine,
}

/// Ties the session lifecycle state machine and approval queue together with
/// placement against the fleet (spec §4.1). Holds one lock per session, like
/// the supervisor it is grounded on, rather than one lock over the whole
/// table.
pub struct SessionCoordinator {
    config: SessionConfig,
    fleet: Arc<FleetManager>,
    sessions: DashMap<Uuid, Arc<Mutex<Entry>>>,
}

impl SessionCoordinator {
    pub fn new(config: SessionConfig, fleet: Arc<FleetManager>) -> Self {
        Self { config, fleet, sessions: DashMap::new() }
    }

    async fn count_active(&self, org_id: &str) -> u32 {
        let mut n = 0;
        for entry in self.sessions.iter() {
            let guard = entry.value().lock().await;
            if guard.session.org_id == org_id && !guard.session.state.is_terminal() {
                n += 1;
            }
        }
        n
    }

    /// Admit a new session: count, select, assign, emit. Returns the snapshot
    /// while still in CREATED; the caller drives it forward as the runner
    /// reports progress via `report_state`.
    pub async fn create(
        &self,
        org_id: String,
        provider_id: ProviderId,
        repo: RepoRef,
        task: Option<String>,
        required_features: &[String],
    ) -> Result<Session> {
        self.create_with_timeout(org_id, provider_id, repo, task, required_features, None).await
    }

    /// Like [`create`](Self::create), but lets the caller override the
    /// watchdog deadline (`options.timeoutMinutes` in the API request) rather
    /// than inheriting `defaultTimeoutMinutes`.
    pub async fn create_with_timeout(
        &self,
        org_id: String,
        provider_id: ProviderId,
        repo: RepoRef,
        task: Option<String>,
        required_features: &[String],
        timeout_minutes: Option<u32>,
    ) -> Result<Session> {
        if self.count_active(&org_id).await >= self.config.max_sessions_per_org {
            return Err(SessionError::SessionLimitExceeded);
        }

        let timeout_minutes = timeout_minutes.unwrap_or(self.config.default_timeout_minutes);
        let mut session = Session::new(org_id, provider_id, repo, task, timeout_minutes);
        let runner_id = self.place(provider_id, required_features, session.session_id).await?;
        session.runner_id = Some(runner_id);
        session.push_log(self.config.audit_log_cap, "session created and placed");

        self.sessions.insert(
            session.session_id,
            Arc::new(Mutex::new(Entry { session: session.clone(), sm: SessionStateMachine::new() })),
        );
        tracing::info!(session_id = %session.session_id, %runner_id, "session created");
        Ok(session)
    }

    /// Bounded select+assign retry loop. `assign` loses the race when another
    /// caller fills the runner first; retrying re-selects rather than failing
    /// the whole admission on one lost race.
    async fn place(&self, provider_id: ProviderId, required_features: &[String], session_id: Uuid) -> Result<Uuid> {
        for _ in 0..self.config.placement_retries.max(1) {
            let Some(runner_id) = self.fleet.select(provider_id, required_features).await else {
                continue;
            };
            match self.fleet.assign(runner_id, session_id).await {
                Ok(true) => return Ok(runner_id),
                Ok(false) => continue,
                Err(_) => continue,
            }
        }
        Err(SessionError::NoCapacity)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<Session> {
        let entry = self.sessions.get(&session_id).ok_or(SessionError::SessionNotFound(session_id))?;
        Ok(entry.value().lock().await.session.clone())
    }

    pub async fn list(&self, org_id: Option<&str>) -> Vec<Session> {
        let mut out = Vec::new();
        for entry in self.sessions.iter() {
            let guard = entry.value().lock().await;
            if org_id.map_or(true, |o| guard.session.org_id == o) {
                out.push(guard.session.clone());
            }
        }
        out.sort_by_key(|s| s.started_at);
        out
    }

    fn entry(&self, session_id: Uuid) -> Result<Arc<Mutex<Entry>>> {
        self.sessions
            .get(&session_id)
            .map(|e| e.value().clone())
            .ok_or(SessionError::SessionNotFound(session_id))
    }

    /// Enters STOPPING and returns immediately; the transition to Completed
    /// happens asynchronously after `stop_grace_period_ms` so STOPPING is an
    /// externally observable state rather than collapsed into one atomic
    /// step. A second call while already STOPPING is idempotent: it extends
    /// no new grace period and hits the state machine's `(Stopping, Stop) =>
    /// Stopping` arm instead of erroring.
    pub async fn stop(&self, session_id: Uuid, reason: Option<String>) -> Result<Session> {
        let entry = self.entry(session_id)?;
        let mut guard = entry.lock().await;
        if guard.session.state.is_terminal() {
            return Err(SessionError::SessionAlreadyStopped(session_id));
        }
        let already_stopping = guard.session.state == SessionState::Stopping;
        guard.sm.transition(SessionEvent::Stop)?;
        guard.session.state = guard.sm.state();
        if let Some(r) = &reason {
            guard.session.failure_reason = Some(r.clone());
        }
        guard.session.push_log(self.config.audit_log_cap, "session stopping");
        let snapshot = guard.session.clone();
        drop(guard);

        if !already_stopping {
            self.spawn_stop_completion(session_id, entry);
        }
        Ok(snapshot)
    }

    /// Completes a stop once the grace window elapses, unless something else
    /// (e.g. a runner-reported terminal state) already moved the session out
    /// of STOPPING.
    fn spawn_stop_completion(&self, session_id: Uuid, entry: Arc<Mutex<Entry>>) {
        let grace = Duration::from_millis(self.config.stop_grace_period_ms);
        let fleet = self.fleet.clone();
        let audit_log_cap = self.config.audit_log_cap;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut guard = entry.lock().await;
            if guard.session.state != SessionState::Stopping {
                return;
            }
            if let Err(err) = guard.sm.transition(SessionEvent::StopComplete) {
                tracing::warn!(%session_id, %err, "stop completion transition failed");
                return;
            }
            guard.session.state = guard.sm.state();
            guard.session.completed_at = Some(Utc::now());
            guard.session.completion_source = Some(CompletionSource::ExplicitStop);
            guard.session.push_log(audit_log_cap, "session stopped");
            if let Some(runner_id) = guard.session.runner_id {
                let _ = fleet.release(runner_id, session_id).await;
            }
        });
    }

    pub async fn pause(&self, session_id: Uuid) -> Result<Session> {
        let entry = self.entry(session_id)?;
        let mut guard = entry.lock().await;
        guard.sm.transition(SessionEvent::Pause)?;
        guard.session.state = guard.sm.state();
        guard.session.push_log(self.config.audit_log_cap, "session paused");
        Ok(guard.session.clone())
    }

    pub async fn resume(&self, session_id: Uuid) -> Result<Session> {
        let entry = self.entry(session_id)?;
        let mut guard = entry.lock().await;
        guard.sm.transition(SessionEvent::Resume)?;
        guard.session.state = guard.sm.state();
        guard.session.push_log(self.config.audit_log_cap, "session resumed");
        Ok(guard.session.clone())
    }

    pub async fn request_approval(
        &self,
        session_id: Uuid,
        action: ApprovalAction,
        description: String,
        context: Option<serde_json::Value>,
    ) -> Result<ApprovalRequest> {
        let entry = self.entry(session_id)?;
        let mut guard = entry.lock().await;
        let req = approval::request(&mut guard.session.pending_approvals, session_id, action, description, context);
        if guard.sm.state() == SessionState::Running {
            guard.sm.transition(SessionEvent::RequestApproval)?;
            guard.session.state = guard.sm.state();
        }
        guard.session.push_log(self.config.audit_log_cap, format!("approval requested: {action:?}"));
        Ok(req)
    }

    pub async fn resolve_approval(
        &self,
        session_id: Uuid,
        approval_id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<Session> {
        let entry = self.entry(session_id)?;
        let mut guard = entry.lock().await;
        let now_empty = approval::resolve(&mut guard.session.pending_approvals, approval_id)
            .map_err(|_| SessionError::ApprovalNotFound(approval_id))?;
        if now_empty && guard.sm.state() == SessionState::WaitingForApproval {
            guard.sm.transition(SessionEvent::ResolveApproval)?;
            guard.session.state = guard.sm.state();
        }
        guard
            .session
            .push_log(self.config.audit_log_cap, format!("approval {approval_id} resolved: {decision:?}"));
        Ok(guard.session.clone())
    }

    /// Apply a fact reported by the runner. Unknown sessions are ignored
    /// (the runner may be racing a stop that already tore the session down).
    /// Reports that don't map to a legal transition from the current state
    /// are logged and dropped rather than surfaced as errors, since the
    /// runner is reporting what happened, not asking permission.
    pub async fn report_state(&self, session_id: Uuid, reported: SessionState) {
        let Some(entry) = self.sessions.get(&session_id).map(|e| e.value().clone()) else {
            return;
        };
        let mut guard = entry.lock().await;
        if guard.session.state.is_terminal() || guard.session.state == reported {
            return;
        }

        let events: &[SessionEvent] = match (guard.session.state, reported) {
            (SessionState::Created, SessionState::PreparingWorkspace) => &[SessionEvent::Admit],
            (SessionState::PreparingWorkspace, SessionState::StartingProvider) => &[SessionEvent::WorkspaceReady],
            (SessionState::StartingProvider, SessionState::Running) => &[SessionEvent::ProviderStarted],
            (_, SessionState::Failed) => &[SessionEvent::Fail],
            (_, SessionState::TimedOut) => &[SessionEvent::Timeout],
            (_, SessionState::Completed) => &[SessionEvent::Stop, SessionEvent::StopComplete],
            _ => &[],
        };
        if events.is_empty() {
            tracing::debug!(session_id = %session_id, from = %guard.session.state, reported = %reported, "ignoring unreachable report");
            return;
        }
        for event in events {
            if guard.sm.transition(*event).is_err() {
                return;
            }
        }
        guard.session.state = guard.sm.state();
        if reported == SessionState::Completed {
            guard.session.completion_source = Some(CompletionSource::RunnerReported);
            guard.session.completed_at = Some(Utc::now());
        }
        if reported.is_terminal() {
            guard.session.completed_at.get_or_insert(Utc::now());
            if reported != SessionState::Completed {
                guard.session.failure_reason.get_or_insert_with(|| format!("reported {reported}"));
            }
        }
        guard.session.push_log(self.config.audit_log_cap, format!("runner reported {reported}"));
        if reported.is_terminal() {
            if let Some(runner_id) = guard.session.runner_id {
                let session_id = guard.session.session_id;
                drop(guard);
                let _ = self.fleet.release(runner_id, session_id).await;
            }
        }
    }

    pub async fn report_usage(&self, session_id: Uuid, delta: Usage) {
        if let Some(entry) = self.sessions.get(&session_id).map(|e| e.value().clone()) {
            let mut guard = entry.lock().await;
            guard.session.usage.add(delta);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        Entry { session: self.session.clone(), sm: self.sm.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::config::FleetConfig;
    use fc_core::types::{RunnerCapabilities, SessionState};

    fn session_config() -> SessionConfig {
        SessionConfig {
            max_sessions_per_org: 2,
            default_timeout_minutes: 60,
            session_data_ttl_hours: 72,
            audit_log_cap: 10,
            placement_retries: 3,
            stop_grace_period_ms: 20,
        }
    }

    async fn coordinator_with_one_runner() -> SessionCoordinator {
        let fleet = Arc::new(FleetManager::new(FleetConfig {
            heartbeat_timeout_ms: 15_000,
            health_check_interval_ms: 5_000,
            max_runners: 10,
            load_factor: 0.9,
            offline_grace_multiplier: 2,
        }));
        fleet
            .register_runner(
                "runner-a".into(),
                RunnerCapabilities { providers: vec![ProviderId::Codex], max_concurrent_sessions: 5, features: vec![] },
                HashMap::new(),
            )
            .await
            .unwrap();
        SessionCoordinator::new(session_config(), fleet)
    }

    fn repo() -> RepoRef {
        RepoRef { url: "https://github.com/acme/widgets".into(), branch: "main".into(), commit: None }
    }

    #[tokio::test]
    async fn create_places_and_returns_created_state() {
        let coord = coordinator_with_one_runner().await;
        let s = coord.create("org-1".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap();
        assert_eq!(s.state, SessionState::Created);
        assert!(s.runner_id.is_some());
    }

    #[tokio::test]
    async fn create_resolves_default_timeout_when_unset() {
        let coord = coordinator_with_one_runner().await;
        let s = coord.create_with_timeout("org-1".into(), ProviderId::Codex, repo(), None, &[], None).await.unwrap();
        assert_eq!(s.timeout_minutes, 60);

        let s2 = coord
            .create_with_timeout("org-1".into(), ProviderId::Codex, repo(), None, &[], Some(15))
            .await
            .unwrap();
        assert_eq!(s2.timeout_minutes, 15);
    }

    #[tokio::test]
    async fn runner_reported_failure_releases_capacity() {
        let coord = coordinator_with_one_runner().await;
        let s = coord.create("org-1".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap();
        coord.report_state(s.session_id, SessionState::Failed).await;
        let got = coord.get(s.session_id).await.unwrap();
        assert_eq!(got.state, SessionState::Failed);
        assert!(got.completed_at.is_some());

        // capacity should be free again even though the runner reported the
        // failure rather than an explicit stop
        coord.create("org-2".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn admission_limit_is_enforced() {
        let coord = coordinator_with_one_runner().await;
        for _ in 0..2 {
            coord.create("org-1".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap();
        }
        let err = coord.create("org-1".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionLimitExceeded));
    }

    #[tokio::test]
    async fn report_state_walks_through_to_running() {
        let coord = coordinator_with_one_runner().await;
        let s = coord.create("org-1".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap();
        coord.report_state(s.session_id, SessionState::PreparingWorkspace).await;
        coord.report_state(s.session_id, SessionState::StartingProvider).await;
        coord.report_state(s.session_id, SessionState::Running).await;
        let got = coord.get(s.session_id).await.unwrap();
        assert_eq!(got.state, SessionState::Running);
    }

    #[tokio::test]
    async fn stop_is_observably_stopping_before_it_completes() {
        let coord = coordinator_with_one_runner().await;
        let s = coord.create("org-1".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap();
        let stopped = coord.stop(s.session_id, Some("done".into())).await.unwrap();
        assert_eq!(stopped.state, SessionState::Stopping);

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let got = coord.get(s.session_id).await.unwrap();
        assert_eq!(got.state, SessionState::Completed);
        assert_eq!(got.completion_source, Some(CompletionSource::ExplicitStop));

        // capacity should be free again for a new session
        coord.create("org-2".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn a_second_stop_during_the_grace_window_is_idempotent() {
        let coord = coordinator_with_one_runner().await;
        let s = coord.create("org-1".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap();
        coord.stop(s.session_id, Some("first".into())).await.unwrap();
        let second = coord.stop(s.session_id, Some("second".into())).await.unwrap();
        assert_eq!(second.state, SessionState::Stopping);

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let got = coord.get(s.session_id).await.unwrap();
        assert_eq!(got.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn approval_round_trip_returns_session_to_running() {
        let coord = coordinator_with_one_runner().await;
        let s = coord.create("org-1".into(), ProviderId::Codex, repo(), None, &[]).await.unwrap();
        coord.report_state(s.session_id, SessionState::PreparingWorkspace).await;
        coord.report_state(s.session_id, SessionState::StartingProvider).await;
        coord.report_state(s.session_id, SessionState::Running).await;

        let req = coord
            .request_approval(s.session_id, ApprovalAction::Merge, "merge pr 1".into(), None)
            .await
            .unwrap();
        let waiting = coord.get(s.session_id).await.unwrap();
        assert_eq!(waiting.state, SessionState::WaitingForApproval);

        let resolved = coord.resolve_approval(s.session_id, req.approval_id, ApprovalDecision::Allow).await.unwrap();
        assert_eq!(resolved.state, SessionState::Running);
    }

    #[tokio::test]
    async fn unknown_session_report_is_ignored() {
        let coord = coordinator_with_one_runner().await;
        coord.report_state(Uuid::new_v4(), SessionState::Running).await;
    }
}
