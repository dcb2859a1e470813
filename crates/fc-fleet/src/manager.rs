use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fc_core::config::FleetConfig;
use fc_core::types::{ProviderId, Runner, RunnerCapabilities, RunnerLoad, RunnerStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{FleetError, Result};

/// A command queued for delivery to a runner. Runners pick these up as the
/// response to their next heartbeat rather than over a persistent
/// connection, the same polling model heartbeats themselves use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerCommand {
    TerminalInput { session_id: Uuid, data: String },
}

const MAX_QUEUED_COMMANDS_PER_RUNNER: usize = 1024;

/// Registered runners keyed by id, each behind its own mutex so concurrent
/// heartbeats for different runners never contend. Hostname lookups use a
/// separate index so registration can detect collisions without scanning.
pub struct FleetManager {
    config: FleetConfig,
    runners: DashMap<Uuid, Arc<Mutex<Runner>>>,
    hostname_index: DashMap<String, Uuid>,
    command_queues: DashMap<Uuid, StdMutex<VecDeque<RunnerCommand>>>,
}

impl FleetManager {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config,
            runners: DashMap::new(),
            hostname_index: DashMap::new(),
            command_queues: DashMap::new(),
        }
    }

    /// Enqueue a command for delivery on the runner's next heartbeat. Drops
    /// the oldest queued command rather than growing unbounded if a runner
    /// stops heartbeating.
    pub fn push_command(&self, runner_id: Uuid, command: RunnerCommand) {
        let mut queue = self.command_queues.entry(runner_id).or_default().lock().expect("command queue lock poisoned");
        if queue.len() >= MAX_QUEUED_COMMANDS_PER_RUNNER {
            queue.pop_front();
        }
        queue.push_back(command);
    }

    /// Drain and return every command queued for `runner_id`.
    pub fn drain_commands(&self, runner_id: Uuid) -> Vec<RunnerCommand> {
        match self.command_queues.get(&runner_id) {
            Some(queue) => queue.lock().expect("command queue lock poisoned").drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub async fn register_runner(
        &self,
        hostname: String,
        capabilities: RunnerCapabilities,
        metadata: HashMap<String, String>,
    ) -> Result<Runner> {
        if let Some(id) = self.hostname_index.get(&hostname).map(|e| *e) {
            let entry = self.runners.get(&id).expect("hostname index out of sync");
            let mut runner = entry.lock().await;
            runner.capabilities = capabilities;
            runner.metadata = metadata;
            runner.status = RunnerStatus::Online;
            runner.last_heartbeat_at = Utc::now();
            info!(runner_id = %id, hostname = %runner.hostname, "runner re-registered");
            return Ok(runner.clone());
        }

        if self.runners.len() as u32 >= self.config.max_runners {
            return Err(FleetError::RunnerLimitExceeded);
        }

        let runner = Runner::new(hostname.clone(), capabilities, metadata);
        let id = runner.runner_id;
        self.hostname_index.insert(hostname, id);
        self.runners.insert(id, Arc::new(Mutex::new(runner.clone())));
        info!(runner_id = %id, "runner registered");
        Ok(runner)
    }

    fn entry(&self, runner_id: Uuid) -> Result<Arc<Mutex<Runner>>> {
        self.runners.get(&runner_id).map(|e| e.clone()).ok_or(FleetError::RunnerNotFound(runner_id))
    }

    /// Process a heartbeat. Returns the `(provider, version)` pairs whose
    /// recorded version changed, so the caller can emit `version_reported`.
    pub async fn heartbeat(
        &self,
        runner_id: Uuid,
        load: RunnerLoad,
        active_sessions: Vec<Uuid>,
        runtime_versions: HashMap<ProviderId, String>,
    ) -> Result<Vec<(ProviderId, String)>> {
        let entry = self.entry(runner_id)?;
        let mut runner = entry.lock().await;

        let mut changed = Vec::new();
        for (provider, version) in &runtime_versions {
            match runner.runtime_versions.get(provider) {
                Some(existing) if existing == version => {}
                _ => changed.push((*provider, version.clone())),
            }
        }

        runner.load = load;
        runner.load.active_sessions = active_sessions.len() as u32;
        runner.assigned_sessions = active_sessions;
        runner.runtime_versions = runtime_versions;
        runner.last_heartbeat_at = Utc::now();
        if runner.status == RunnerStatus::Offline {
            runner.status = RunnerStatus::Online;
        }

        Ok(changed)
    }

    pub async fn get_runner(&self, runner_id: Uuid) -> Result<Runner> {
        let entry = self.entry(runner_id)?;
        Ok(entry.lock().await.clone())
    }

    pub async fn list_runners(&self) -> Vec<Runner> {
        let mut out = Vec::with_capacity(self.runners.len());
        for entry in self.runners.iter() {
            out.push(entry.value().lock().await.clone());
        }
        out
    }

    pub async fn drain_runner(&self, runner_id: Uuid) -> Result<Runner> {
        let entry = self.entry(runner_id)?;
        let mut runner = entry.lock().await;
        runner.status = RunnerStatus::Draining;
        Ok(runner.clone())
    }

    pub async fn set_maintenance(&self, runner_id: Uuid, on: bool) -> Result<Runner> {
        let entry = self.entry(runner_id)?;
        let mut runner = entry.lock().await;
        runner.status = if on { RunnerStatus::Maintenance } else { RunnerStatus::Online };
        Ok(runner.clone())
    }

    pub async fn remove_runner(&self, runner_id: Uuid) -> Result<()> {
        let entry = self.entry(runner_id)?;
        {
            let runner = entry.lock().await;
            if !runner.assigned_sessions.is_empty() {
                return Err(FleetError::RunnerHasActiveSessions(runner_id));
            }
        }
        if let Some((_, entry)) = self.runners.remove(&runner_id) {
            let runner = entry.lock().await;
            self.hostname_index.remove(&runner.hostname);
        }
        Ok(())
    }

    /// Advisory placement: among online runners with capacity and matching
    /// provider (and, if requested, required features), pick the lowest
    /// utilization ratio. Ties break by active session count, then hostname.
    pub async fn select(&self, provider_id: ProviderId, required_features: &[String]) -> Option<Uuid> {
        let mut best: Option<(Uuid, f64, u32, String)> = None;

        for entry in self.runners.iter() {
            let runner = entry.value().lock().await;
            if runner.status != RunnerStatus::Online {
                continue;
            }
            if !runner.capabilities.providers.contains(&provider_id) {
                continue;
            }
            if !required_features.iter().all(|f| runner.capabilities.features.contains(f)) {
                continue;
            }
            let cap = (runner.capabilities.max_concurrent_sessions as f64 * self.config.load_factor).floor();
            if (runner.load.active_sessions as f64) >= cap {
                continue;
            }

            let util = runner.utilization();
            let candidate = (runner.runner_id, util, runner.load.active_sessions, runner.hostname.clone());
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    if candidate.1 < current.1
                        || (candidate.1 == current.1 && candidate.2 < current.2)
                        || (candidate.1 == current.1 && candidate.2 == current.2 && candidate.3 < current.3)
                    {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }

        best.map(|(id, ..)| id)
    }

    /// Authoritative capacity increment. Re-checks capacity under the
    /// runner's own lock; returns `false` on a lost race rather than an
    /// error, since the coordinator is expected to retry placement.
    pub async fn assign(&self, runner_id: Uuid, session_id: Uuid) -> Result<bool> {
        let entry = self.entry(runner_id)?;
        let mut runner = entry.lock().await;
        if runner.status != RunnerStatus::Online {
            return Ok(false);
        }
        let cap = (runner.capabilities.max_concurrent_sessions as f64 * self.config.load_factor).floor();
        if runner.load.active_sessions as f64 >= cap {
            return Ok(false);
        }
        runner.assigned_sessions.push(session_id);
        runner.load.active_sessions = runner.assigned_sessions.len() as u32;
        Ok(true)
    }

    pub async fn release(&self, runner_id: Uuid, session_id: Uuid) -> Result<bool> {
        let entry = self.entry(runner_id)?;
        let mut runner = entry.lock().await;
        let before = runner.assigned_sessions.len();
        runner.assigned_sessions.retain(|s| *s != session_id);
        runner.load.active_sessions = runner.assigned_sessions.len() as u32;
        Ok(runner.assigned_sessions.len() != before)
    }

    /// Liveness sweep (spec §4.2): any non-offline runner whose last
    /// heartbeat predates `heartbeat_timeout_ms` is marked offline. Returns
    /// the ids newly marked offline so the caller can emit `runner_offline`.
    pub async fn liveness_sweep(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let timeout = chrono::Duration::milliseconds(self.config.heartbeat_timeout_ms as i64);
        let mut newly_offline = Vec::new();
        for entry in self.runners.iter() {
            let mut runner = entry.value().lock().await;
            if runner.status != RunnerStatus::Offline && now - runner.last_heartbeat_at > timeout {
                runner.status = RunnerStatus::Offline;
                newly_offline.push(runner.runner_id);
            }
        }
        newly_offline
    }

    /// Runners that have been offline longer than
    /// `heartbeat_timeout_ms * offline_grace_multiplier`, along with their
    /// still-assigned sessions — used by the Session Coordinator to fail
    /// sessions whose runner is presumed gone.
    pub async fn runners_past_offline_grace(&self, now: DateTime<Utc>) -> Vec<(Uuid, Vec<Uuid>)> {
        let grace = chrono::Duration::milliseconds(
            (self.config.heartbeat_timeout_ms * self.config.offline_grace_multiplier as u64) as i64,
        );
        let mut out = Vec::new();
        for entry in self.runners.iter() {
            let runner = entry.value().lock().await;
            if runner.status == RunnerStatus::Offline
                && now - runner.last_heartbeat_at > grace
                && !runner.assigned_sessions.is_empty()
            {
                out.push((runner.runner_id, runner.assigned_sessions.clone()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(provider: ProviderId, max: u32) -> RunnerCapabilities {
        RunnerCapabilities { providers: vec![provider], max_concurrent_sessions: max, features: vec![] }
    }

    #[tokio::test]
    async fn register_then_reregister_keeps_same_id() {
        let fm = FleetManager::new(FleetConfig::default());
        let r1 = fm.register_runner("host-a".into(), caps(ProviderId::Codex, 5), HashMap::new()).await.unwrap();
        let r2 = fm.register_runner("host-a".into(), caps(ProviderId::Codex, 10), HashMap::new()).await.unwrap();
        assert_eq!(r1.runner_id, r2.runner_id);
        assert_eq!(r2.capabilities.max_concurrent_sessions, 10);
    }

    #[tokio::test]
    async fn select_picks_least_utilized() {
        let fm = FleetManager::new(FleetConfig::default());
        let a = fm.register_runner("a".into(), caps(ProviderId::Codex, 10), HashMap::new()).await.unwrap();
        let b = fm.register_runner("b".into(), caps(ProviderId::Codex, 10), HashMap::new()).await.unwrap();

        fm.assign(a.runner_id, Uuid::new_v4()).await.unwrap();
        fm.assign(a.runner_id, Uuid::new_v4()).await.unwrap();

        let chosen = fm.select(ProviderId::Codex, &[]).await.unwrap();
        assert_eq!(chosen, b.runner_id);
    }

    #[tokio::test]
    async fn assign_rechecks_capacity_authoritatively() {
        let mut cfg = FleetConfig::default();
        cfg.load_factor = 1.0;
        let fm = FleetManager::new(cfg);
        let r = fm.register_runner("a".into(), caps(ProviderId::Codex, 1), HashMap::new()).await.unwrap();

        assert!(fm.assign(r.runner_id, Uuid::new_v4()).await.unwrap());
        assert!(!fm.assign(r.runner_id, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn remove_fails_with_active_sessions() {
        let fm = FleetManager::new(FleetConfig::default());
        let r = fm.register_runner("a".into(), caps(ProviderId::Codex, 5), HashMap::new()).await.unwrap();
        fm.assign(r.runner_id, Uuid::new_v4()).await.unwrap();
        let err = fm.remove_runner(r.runner_id).await.unwrap_err();
        assert!(matches!(err, FleetError::RunnerHasActiveSessions(_)));
    }

    #[tokio::test]
    async fn liveness_sweep_marks_offline_after_timeout() {
        let mut cfg = FleetConfig::default();
        cfg.heartbeat_timeout_ms = 10;
        let fm = FleetManager::new(cfg);
        let r = fm.register_runner("a".into(), caps(ProviderId::Codex, 5), HashMap::new()).await.unwrap();

        let future = Utc::now() + chrono::Duration::milliseconds(50);
        let offline = fm.liveness_sweep(future).await;
        assert_eq!(offline, vec![r.runner_id]);

        let runner = fm.get_runner(r.runner_id).await.unwrap();
        assert_eq!(runner.status, RunnerStatus::Offline);
    }

    #[tokio::test]
    async fn maintenance_excludes_from_placement() {
        let fm = FleetManager::new(FleetConfig::default());
        let r = fm.register_runner("a".into(), caps(ProviderId::Codex, 5), HashMap::new()).await.unwrap();
        fm.set_maintenance(r.runner_id, true).await.unwrap();
        assert!(fm.select(ProviderId::Codex, &[]).await.is_none());
    }
}
