use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fc_core::config::RolloutConfig;
use fc_core::types::{Channel, OrgAssignment, OrgRuntimeConfig, Rollout, RolloutEvent, RolloutState};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::canary::{CanaryStatus, SuiteResult};
use crate::error::{Result, UpdateError};

const MAX_EVENTS: usize = 10_000;

/// Resolved per-rollout-stage metrics. The rollout controller only needs
/// counts; rate derivation happens here, not in the source.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolloutMetrics {
    pub sessions_started: u64,
    pub failures: u64,
    pub disconnects: u64,
}

impl RolloutMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.sessions_started == 0 { 0.0 } else { self.failures as f64 / self.sessions_started as f64 }
    }

    pub fn disconnect_rate(&self) -> f64 {
        if self.sessions_started == 0 { 0.0 } else { self.disconnects as f64 / self.sessions_started as f64 }
    }
}

/// Queried by `checkAndProgressRollouts` to decide whether a rolling-out
/// stage is healthy enough to advance. Implemented outside this crate by
/// whatever wires the Session Coordinator and Fleet Manager together, since
/// this crate must not depend back on session internals.
#[async_trait::async_trait]
pub trait RolloutMetricsSource: Send + Sync {
    async fn metrics_for(&self, target_build_id: &str, since: DateTime<Utc>) -> RolloutMetrics;
}

struct Entry {
    rollout: Rollout,
}

pub struct RolloutController {
    config: RolloutConfig,
    rollouts: DashMap<Uuid, Mutex<Entry>>,
    events: Mutex<Vec<RolloutEvent>>,
}

impl RolloutController {
    pub fn new(config: RolloutConfig) -> Self {
        Self { config, rollouts: DashMap::new(), events: Mutex::new(Vec::new()) }
    }

    async fn log(&self, rollout_id: Uuid, kind: &str, message: impl Into<String>) {
        let mut events = self.events.lock().await;
        events.push(RolloutEvent { rollout_id, kind: kind.to_string(), message: message.into(), at: Utc::now() });
        while events.len() > MAX_EVENTS {
            events.remove(0);
        }
    }

    fn active_count_for_channel(&self, channel: Channel) -> usize {
        self.rollouts
            .iter()
            .filter(|e| {
                // best-effort: try_lock avoids blocking on a concurrent mutator;
                // a rollout mid-mutation is still "active" either way.
                e.value().try_lock().map(|g| g.rollout.channel == channel && is_active(g.rollout.state)).unwrap_or(true)
            })
            .count()
    }

    pub async fn initiate_rollout(
        &self,
        channel: Channel,
        target_build_id: String,
        canary_result: Option<&SuiteResult>,
        eligible_orgs: &[OrgRuntimeConfig],
    ) -> Result<Rollout> {
        let channel_cfg = fc_core::types::channel_config(channel);

        if channel_cfg.requires_canary {
            let ok = canary_result
                .map(|r| r.status == CanaryStatus::Passed && r.metrics.pass_rate >= channel_cfg.canary_threshold)
                .unwrap_or(false);
            if !ok {
                return Err(UpdateError::CanaryRequired);
            }
        }

        if self.active_count_for_channel(channel) as u32 >= self.config.max_concurrent_rollouts {
            return Err(UpdateError::TooManyConcurrentRollouts);
        }

        let now = Utc::now();
        let percentage = channel_cfg.stages[0];
        let mut rollout = Rollout {
            rollout_id: Uuid::new_v4(),
            target_build_id: target_build_id.clone(),
            channel,
            state: RolloutState::RollingOut,
            current_percentage: percentage,
            target_percentage: 100,
            started_at: now,
            last_updated_at: now,
            affected_orgs: Vec::new(),
            canary_result_ref: canary_result.map(|r| r.suite_name.clone()),
            error: None,
        };

        assign_orgs_to_percentage(&mut rollout, eligible_orgs, percentage);

        let id = rollout.rollout_id;
        self.rollouts.insert(id, Mutex::new(Entry { rollout: rollout.clone() }));
        self.log(id, "rollout_started", format!("rollout of {target_build_id} started at {percentage}%")).await;
        Ok(rollout)
    }

    fn entry(&self, rollout_id: Uuid) -> Result<dashmap::mapref::one::Ref<'_, Uuid, Mutex<Entry>>> {
        self.rollouts.get(&rollout_id).ok_or(UpdateError::RolloutNotFound(rollout_id))
    }

    pub async fn advance_rollout(&self, rollout_id: Uuid, eligible_orgs: &[OrgRuntimeConfig]) -> Result<Rollout> {
        let entry = self.entry(rollout_id)?;
        let mut guard = entry.value().lock().await;
        if guard.rollout.state != RolloutState::RollingOut {
            return Err(UpdateError::InvalidRolloutState);
        }

        let stages = fc_core::types::channel_config(guard.rollout.channel).stages;
        let next = stages.iter().copied().find(|s| *s > guard.rollout.current_percentage);
        let completed = next.is_none();

        match next {
            Some(pct) => {
                guard.rollout.current_percentage = pct;
                guard.rollout.last_updated_at = Utc::now();
                assign_orgs_to_percentage(&mut guard.rollout, eligible_orgs, pct);
            }
            None => {
                guard.rollout.state = RolloutState::Completed;
                guard.rollout.current_percentage = 100;
                guard.rollout.last_updated_at = Utc::now();
            }
        }
        let snapshot = guard.rollout.clone();
        drop(guard);
        drop(entry);
        if completed {
            self.log(rollout_id, "rollout_completed", "reached 100% and completed").await;
        } else {
            self.log(rollout_id, "stage_advanced", format!("advanced to {}%", snapshot.current_percentage)).await;
        }
        Ok(snapshot)
    }

    pub async fn pause_rollout(&self, rollout_id: Uuid) -> Result<Rollout> {
        self.toggle(rollout_id, RolloutState::RollingOut, RolloutState::Paused, "rollout_paused").await
    }

    pub async fn resume_rollout(&self, rollout_id: Uuid) -> Result<Rollout> {
        self.toggle(rollout_id, RolloutState::Paused, RolloutState::RollingOut, "rollout_resumed").await
    }

    async fn toggle(&self, rollout_id: Uuid, from: RolloutState, to: RolloutState, kind: &str) -> Result<Rollout> {
        let entry = self.entry(rollout_id)?;
        let mut guard = entry.value().lock().await;
        if guard.rollout.state != from {
            return Err(UpdateError::InvalidRolloutState);
        }
        guard.rollout.state = to;
        guard.rollout.last_updated_at = Utc::now();
        let snapshot = guard.rollout.clone();
        drop(guard);
        self.log(rollout_id, kind, format!("{from:?} -> {to:?}")).await;
        Ok(snapshot)
    }

    pub async fn rollback(&self, rollout_id: Uuid, reason: String) -> Result<Rollout> {
        let entry = self.entry(rollout_id)?;
        let mut guard = entry.value().lock().await;
        if !is_active(guard.rollout.state) {
            return Err(UpdateError::InvalidRolloutState);
        }

        let target = guard.rollout.target_build_id.clone();
        for assignment in &mut guard.rollout.affected_orgs {
            if assignment.to_build_id == target {
                match assignment.from_build_id.clone() {
                    Some(prev) => assignment.to_build_id = prev,
                    None => {}
                }
            }
        }
        guard.rollout.affected_orgs.retain(|a| a.to_build_id != target || a.from_build_id.is_none());
        guard.rollout.state = RolloutState::RolledBack;
        guard.rollout.current_percentage = 0;
        guard.rollout.error = Some(reason.clone());
        guard.rollout.last_updated_at = Utc::now();
        let snapshot = guard.rollout.clone();
        drop(guard);
        drop(entry);
        self.log(rollout_id, "rollback_initiated", reason).await;
        self.log(rollout_id, "rollback_completed", "rollback applied").await;
        Ok(snapshot)
    }

    /// Periodic tick (`checkAndProgressRollouts`). Skipped entirely when
    /// `auto_progress` is disabled.
    pub async fn check_and_progress(
        &self,
        now: DateTime<Utc>,
        metrics_source: &dyn RolloutMetricsSource,
        eligible_orgs_for: impl Fn(Channel) -> Vec<OrgRuntimeConfig>,
    ) {
        if !self.config.auto_progress {
            return;
        }
        let candidates: Vec<Uuid> = self
            .rollouts
            .iter()
            .filter(|e| e.value().try_lock().map(|g| g.rollout.state == RolloutState::RollingOut).unwrap_or(false))
            .map(|e| *e.key())
            .collect();

        for rollout_id in candidates {
            let Ok(entry) = self.entry(rollout_id) else { continue };
            let (channel, target_build_id, last_updated_at, delay_hours) = {
                let guard = entry.value().lock().await;
                let delay = fc_core::types::channel_config(guard.rollout.channel).rollout_delay_hours;
                (guard.rollout.channel, guard.rollout.target_build_id.clone(), guard.rollout.last_updated_at, delay)
            };
            drop(entry);

            if now - last_updated_at < chrono::Duration::hours(delay_hours as i64) {
                continue;
            }

            let metrics = metrics_source.metrics_for(&target_build_id, last_updated_at).await;
            if metrics.sessions_started < self.config.rollback_thresholds.min_session_count as u64 {
                continue;
            }
            if metrics.failure_rate() > self.config.rollback_thresholds.max_failure_rate
                || metrics.disconnect_rate() > self.config.rollback_thresholds.max_disconnect_rate
            {
                let _ = self
                    .rollback(rollout_id, format!("automatic rollback: failure_rate={:.3} disconnect_rate={:.3}", metrics.failure_rate(), metrics.disconnect_rate()))
                    .await;
            } else {
                let eligible = eligible_orgs_for(channel);
                let _ = self.advance_rollout(rollout_id, &eligible).await;
            }
        }
    }

    pub async fn get(&self, rollout_id: Uuid) -> Result<Rollout> {
        let entry = self.entry(rollout_id)?;
        Ok(entry.value().lock().await.rollout.clone())
    }

    pub async fn events(&self) -> Vec<RolloutEvent> {
        self.events.lock().await.clone()
    }
}

fn is_active(state: RolloutState) -> bool {
    matches!(state, RolloutState::RollingOut | RolloutState::Paused)
}

/// Deterministically grows the assignment set to `ceil(len(eligible) * pct / 100)`
/// by adding unassigned eligible orgs in their given order.
fn assign_orgs_to_percentage(rollout: &mut Rollout, eligible: &[OrgRuntimeConfig], percentage: u8) {
    let target_count = ((eligible.len() as u64 * percentage as u64).div_ceil(100)) as usize;
    let now = Utc::now();
    let already: std::collections::HashSet<&str> =
        rollout.affected_orgs.iter().map(|a| a.org_id.as_str()).collect();

    for org in eligible {
        if rollout.affected_orgs.len() >= target_count {
            break;
        }
        if already.contains(org.org_id.as_str()) {
            continue;
        }
        rollout.affected_orgs.push(OrgAssignment {
            org_id: org.org_id.clone(),
            from_build_id: org.current_build_id.clone(),
            to_build_id: rollout.target_build_id.clone(),
            at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::CanaryStatus;
    use fc_core::types::CanaryMetrics;

    fn config() -> RolloutConfig {
        RolloutConfig {
            max_concurrent_rollouts: 2,
            check_interval_ms: 60_000,
            auto_progress: true,
            rollback_thresholds: fc_core::config::RollbackThresholds {
                max_failure_rate: 0.1,
                max_disconnect_rate: 0.2,
                min_session_count: 10,
            },
        }
    }

    fn passing_canary() -> SuiteResult {
        SuiteResult {
            suite_name: "golden_path".into(),
            status: CanaryStatus::Passed,
            metrics: CanaryMetrics {
                total_tests: 10,
                passed: 10,
                failed: 0,
                errored: 0,
                skipped: 0,
                pass_rate: 1.0,
                avg_session_start_ms: 0.0,
                avg_time_to_first_output_ms: 0.0,
                disconnect_rate: 0.0,
            },
        }
    }

    fn orgs(n: usize) -> Vec<OrgRuntimeConfig> {
        (0..n)
            .map(|i| OrgRuntimeConfig {
                org_id: format!("org-{i}"),
                channel: Channel::Stable,
                pinned_build_id: None,
                beta_opt_in: false,
                auto_upgrade: true,
                notifications: false,
                enterprise: None,
                current_build_id: Some("old-build".into()),
                updated_at: Utc::now(),
                updated_by: "system".into(),
            })
            .collect()
    }

    #[tokio::test]
    async fn initiate_requires_passing_canary_on_stable() {
        let ctrl = RolloutController::new(config());
        let err = ctrl.initiate_rollout(Channel::Stable, "b1".into(), None, &orgs(10)).await.unwrap_err();
        assert!(matches!(err, UpdateError::CanaryRequired));
    }

    #[tokio::test]
    async fn initiate_assigns_ceiling_percentage_of_eligible_orgs() {
        let ctrl = RolloutController::new(config());
        let canary = passing_canary();
        let rollout = ctrl.initiate_rollout(Channel::Stable, "b1".into(), Some(&canary), &orgs(100)).await.unwrap();
        assert_eq!(rollout.current_percentage, 1);
        assert_eq!(rollout.affected_orgs.len(), 1);
    }

    #[tokio::test]
    async fn advance_extends_assignment_and_eventually_completes() {
        let ctrl = RolloutController::new(config());
        let canary = passing_canary();
        let rollout = ctrl.initiate_rollout(Channel::Stable, "b1".into(), Some(&canary), &orgs(100)).await.unwrap();
        let id = rollout.rollout_id;

        let r2 = ctrl.advance_rollout(id, &orgs(100)).await.unwrap();
        assert_eq!(r2.current_percentage, 10);
        let r3 = ctrl.advance_rollout(id, &orgs(100)).await.unwrap();
        assert_eq!(r3.current_percentage, 50);
        let r4 = ctrl.advance_rollout(id, &orgs(100)).await.unwrap();
        assert_eq!(r4.current_percentage, 100);
        let r5 = ctrl.advance_rollout(id, &orgs(100)).await.unwrap();
        assert_eq!(r5.state, RolloutState::Completed);
    }

    #[tokio::test]
    async fn rollback_reverts_assignments_to_previous_build() {
        let ctrl = RolloutController::new(config());
        let canary = passing_canary();
        let rollout = ctrl.initiate_rollout(Channel::Pinned, "b1".into(), None, &orgs(10)).await.unwrap();
        let id = rollout.rollout_id;
        let _ = canary;

        let rolled_back = ctrl.rollback(id, "bad metrics".into()).await.unwrap();
        assert_eq!(rolled_back.state, RolloutState::RolledBack);
        assert_eq!(rolled_back.current_percentage, 0);
        for a in &rolled_back.affected_orgs {
            assert_eq!(a.to_build_id, "old-build");
        }
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips() {
        let ctrl = RolloutController::new(config());
        let rollout = ctrl.initiate_rollout(Channel::Pinned, "b1".into(), None, &orgs(10)).await.unwrap();
        let id = rollout.rollout_id;
        let paused = ctrl.pause_rollout(id).await.unwrap();
        assert_eq!(paused.state, RolloutState::Paused);
        let resumed = ctrl.resume_rollout(id).await.unwrap();
        assert_eq!(resumed.state, RolloutState::RollingOut);
    }
}
