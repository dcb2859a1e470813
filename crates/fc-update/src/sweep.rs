use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fc_core::config::SweepConfig;
use fc_core::types::RepoRef;
use fc_harness::rate_limiter::{RateLimitConfig, RateLimitError, RateLimiter};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, UpdateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepType {
    Maintenance,
    LintFix,
    DependencyUpdate,
    Custom,
}

#[derive(Debug, Clone)]
pub struct OptedInRepo {
    pub repo: RepoRef,
    pub opted_in: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoSweepStatus {
    Success,
    Failed,
    Skipped,
    NoChanges,
}

#[derive(Debug, Clone)]
pub struct RepoSweepResult {
    pub repo_url: String,
    pub status: RepoSweepStatus,
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepJobState {
    Running,
    Completed,
    Cancelled,
}

/// `create_prs` is the only write-amplifying knob this struct admits; there
/// is deliberately no `auto_merge` field anywhere in this shape, so a sweep
/// can never be configured to merge on its own.
#[derive(Debug, Clone, Copy)]
pub struct TriggerOptions {
    pub max_repos_per_run: Option<u32>,
    pub rate_limit_per_minute: Option<u32>,
    pub create_prs: bool,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self { max_repos_per_run: None, rate_limit_per_minute: None, create_prs: true }
    }
}

pub struct SweepJob {
    pub job_id: Uuid,
    pub build_id: String,
    pub sweep_type: SweepType,
    pub state: SweepJobState,
    pub results: Vec<RepoSweepResult>,
    pub started_at: DateTime<Utc>,
    cancel: Arc<AtomicBool>,
}

impl SweepJob {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

pub struct SweepManager {
    config: SweepConfig,
    active_jobs: DashMap<Uuid, Mutex<SweepJob>>,
}

impl SweepManager {
    pub fn new(config: SweepConfig) -> Self {
        Self { config, active_jobs: DashMap::new() }
    }

    fn active_count(&self) -> usize {
        self.active_jobs
            .iter()
            .filter(|e| e.value().try_lock().map(|g| g.state == SweepJobState::Running).unwrap_or(true))
            .count()
    }

    /// Runs a post-update sweep across opted-in repos, one at a time, paced
    /// at `rate_limit` repos/minute. `run_one` executes one repo's sweep
    /// (the actual git/PR work lives outside this crate).
    pub async fn trigger_post_update_sweep<F, Fut>(
        &self,
        build_id: String,
        sweep_type: SweepType,
        repos: &[OptedInRepo],
        options: TriggerOptions,
        run_one: F,
    ) -> Result<Uuid>
    where
        F: Fn(&RepoRef, SweepType, bool) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<RepoSweepResult, anyhow::Error>>,
    {
        if !self.config.enabled {
            return Err(UpdateError::NoOptedInRepos);
        }

        let opted_in: Vec<&OptedInRepo> = repos.iter().filter(|r| r.opted_in).collect();
        if opted_in.is_empty() {
            return Err(UpdateError::NoOptedInRepos);
        }

        if self.active_count() as u32 >= self.config.max_concurrent_sweeps {
            return Err(UpdateError::TooManySweeps);
        }

        let max_repos = options.max_repos_per_run.unwrap_or(self.config.default_max_repos_per_run) as usize;
        let rate_limit = options.rate_limit_per_minute.unwrap_or(self.config.default_rate_limit).max(1);
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(rate_limit as u64));

        let job_id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        self.active_jobs.insert(
            job_id,
            Mutex::new(SweepJob {
                job_id,
                build_id,
                sweep_type,
                state: SweepJobState::Running,
                results: Vec::new(),
                started_at: Utc::now(),
                cancel: cancel.clone(),
            }),
        );

        for opted in opted_in.into_iter().take(max_repos) {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            while let Err(RateLimitError::Exceeded { retry_after, .. }) = limiter.check("sweep") {
                tokio::time::sleep(retry_after).await;
            }

            let result = match run_one(&opted.repo, sweep_type, options.create_prs).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(repo = %opted.repo.url, error = %e, "sweep repo failed");
                    RepoSweepResult { repo_url: opted.repo.url.clone(), status: RepoSweepStatus::Failed, pr_url: None }
                }
            };

            if let Some(entry) = self.active_jobs.get(&job_id) {
                entry.value().lock().await.results.push(result);
            }
        }

        if let Some(entry) = self.active_jobs.get(&job_id) {
            let mut guard = entry.value().lock().await;
            guard.state = if cancel.load(Ordering::SeqCst) { SweepJobState::Cancelled } else { SweepJobState::Completed };
        }

        Ok(job_id)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let entry = self.active_jobs.get(&job_id).ok_or(UpdateError::NoOptedInRepos)?;
        entry.value().lock().await.cancel();
        Ok(())
    }

    pub async fn results(&self, job_id: Uuid) -> Option<Vec<RepoSweepResult>> {
        let entry = self.active_jobs.get(&job_id)?;
        Some(entry.value().lock().await.results.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SweepConfig {
        SweepConfig { max_concurrent_sweeps: 2, default_rate_limit: 600, default_max_repos_per_run: 50, enabled: true }
    }

    fn repo(url: &str, opted_in: bool) -> OptedInRepo {
        OptedInRepo { repo: RepoRef { url: url.to_string(), branch: "main".to_string(), commit: None }, opted_in }
    }

    #[tokio::test]
    async fn filters_to_opted_in_repos_only() {
        let mgr = SweepManager::new(config());
        let repos = vec![repo("a", true), repo("b", false)];
        let job_id = mgr
            .trigger_post_update_sweep("build-1".into(), SweepType::Maintenance, &repos, TriggerOptions::default(), |r, _, _| {
                let url = r.url.clone();
                async move { Ok(RepoSweepResult { repo_url: url, status: RepoSweepStatus::Success, pr_url: None }) }
            })
            .await
            .unwrap();
        let results = mgr.results(job_id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].repo_url, "a");
    }

    #[tokio::test]
    async fn errors_when_no_repos_opted_in() {
        let mgr = SweepManager::new(config());
        let repos = vec![repo("a", false)];
        let err = mgr
            .trigger_post_update_sweep("build-1".into(), SweepType::LintFix, &repos, TriggerOptions::default(), |r, _, _| {
                let url = r.url.clone();
                async move { Ok(RepoSweepResult { repo_url: url, status: RepoSweepStatus::Success, pr_url: None }) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::NoOptedInRepos));
    }

    #[tokio::test]
    async fn repo_level_failure_does_not_abort_job() {
        let mgr = SweepManager::new(config());
        let repos = vec![repo("a", true), repo("b", true)];
        let job_id = mgr
            .trigger_post_update_sweep("build-1".into(), SweepType::Maintenance, &repos, TriggerOptions::default(), |r, _, _| {
                let url = r.url.clone();
                async move {
                    if url == "a" {
                        Err(anyhow::anyhow!("boom"))
                    } else {
                        Ok(RepoSweepResult { repo_url: url, status: RepoSweepStatus::Success, pr_url: None })
                    }
                }
            })
            .await
            .unwrap();
        let results = mgr.results(job_id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, RepoSweepStatus::Failed);
        assert_eq!(results[1].status, RepoSweepStatus::Success);
    }
}
