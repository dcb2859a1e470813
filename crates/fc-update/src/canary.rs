use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fc_core::config::CanaryConfig;
use fc_core::types::{CanaryMetrics, ProviderId};
use fc_harness::circuit_breaker::CircuitBreakerError;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One test case in a canary suite. `run` is provided by the caller per test
/// case (it hits the actual runner/provider under test); this module only
/// owns scheduling, retry, and aggregation.
pub struct TestCase {
    pub name: String,
    pub providers: Vec<ProviderId>,
}

/// Test cases for the named default suite (adapter_contract, golden_path,
/// approval_gate, metering), tagged for `provider`. Real per-suite case
/// bodies live with whatever exercises them (session creation, approval
/// flow, ...); this only shapes which case runs under which suite name.
pub fn default_suite_cases(suite_name: &str, provider: ProviderId) -> Vec<TestCase> {
    vec![TestCase { name: suite_name.to_string(), providers: vec![provider] }]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseOutcome {
    Passed,
    Failed,
    Errored,
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanaryStatus {
    Passed,
    Failed,
    Errored,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub suite_name: String,
    pub status: CanaryStatus,
    pub metrics: CanaryMetrics,
}

/// A completed, server-tracked canary run. `run_id` is the only thing a
/// rollout initiation request is allowed to reference — callers cannot
/// self-report a `SuiteResult` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryRunRecord {
    pub run_id: Uuid,
    pub build_id: String,
    pub result: SuiteResult,
    pub completed_at: DateTime<Utc>,
}

/// Tracks completed canary runs so the Rollout Controller can look one up by
/// ID instead of trusting a client-supplied pass/fail claim.
#[derive(Default)]
pub struct CanaryManager {
    runs: DashMap<Uuid, CanaryRunRecord>,
}

impl CanaryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actually drives [`run_suite`] and records the outcome under a new
    /// run ID, returning that ID.
    pub async fn trigger_run<F, Fut>(
        &self,
        build_id: String,
        suite_name: &str,
        cases: &[TestCase],
        provider: ProviderId,
        config: &CanaryConfig,
        exec: F,
    ) -> Uuid
    where
        F: Fn(&TestCase) -> Fut,
        Fut: std::future::Future<Output = Result<CaseAttempt, CircuitBreakerError>>,
    {
        let result = run_suite(suite_name, cases, provider, config, exec).await;
        let run_id = Uuid::new_v4();
        self.runs.insert(run_id, CanaryRunRecord { run_id, build_id, result, completed_at: Utc::now() });
        run_id
    }

    pub fn get(&self, run_id: Uuid) -> Option<CanaryRunRecord> {
        self.runs.get(&run_id).map(|e| e.value().clone())
    }
}

/// Runs one named suite's test cases against a provider, honoring the suite
/// deadline and per-case retry budget. `exec` executes a single attempt of a
/// single case and reports its outcome plus timing, in milliseconds.
pub async fn run_suite<F, Fut>(
    suite_name: &str,
    cases: &[TestCase],
    provider: ProviderId,
    config: &CanaryConfig,
    exec: F,
) -> SuiteResult
where
    F: Fn(&TestCase) -> Fut,
    Fut: std::future::Future<Output = Result<CaseAttempt, CircuitBreakerError>>,
{
    let deadline = Duration::from_millis(config.default_timeout_ms);
    let applicable: Vec<&TestCase> = cases.iter().filter(|c| c.providers.contains(&provider)).collect();
    let chunk_size = (config.max_concurrency as usize).max(1);

    let run = async {
        let mut outcomes = Vec::with_capacity(applicable.len());
        let mut start_times = Vec::new();
        let mut first_output_times = Vec::new();
        let mut disconnects = Vec::with_capacity(applicable.len());
        'chunks: for chunk in applicable.chunks(chunk_size) {
            let results = join_all(chunk.iter().map(|case| run_case(case, config, &exec))).await;
            for (outcome, start_ms, first_output_ms, disconnected) in results {
                if let Some(ms) = start_ms {
                    start_times.push(ms);
                }
                if let Some(ms) = first_output_ms {
                    first_output_times.push(ms);
                }
                let stop_here = !config.continue_on_failure && matches!(outcome, CaseOutcome::Failed);
                outcomes.push(outcome);
                disconnects.push(disconnected);
                if stop_here {
                    break 'chunks;
                }
            }
        }
        (outcomes, start_times, first_output_times, disconnects)
    };

    match tokio::time::timeout(deadline, run).await {
        Ok((outcomes, starts, firsts, disconnects)) => {
            let metrics = aggregate(&outcomes, &starts, &firsts, &disconnects);
            let status = overall_status(&outcomes, false);
            SuiteResult { suite_name: suite_name.to_string(), status, metrics }
        }
        Err(_) => SuiteResult {
            suite_name: suite_name.to_string(),
            status: CanaryStatus::TimedOut,
            metrics: CanaryMetrics {
                total_tests: applicable.len() as u32,
                passed: 0,
                failed: 0,
                errored: 0,
                skipped: applicable.len() as u32,
                pass_rate: 0.0,
                avg_session_start_ms: 0.0,
                avg_time_to_first_output_ms: 0.0,
                disconnect_rate: 0.0,
            },
        },
    }
}

/// Runs up to `retryCount+1` attempts of one case, retrying only on timeout or
/// error outcomes. Split out of [`run_suite`] so cases within a chunk can run
/// concurrently via `join_all`.
async fn run_case<F, Fut>(
    case: &TestCase,
    config: &CanaryConfig,
    exec: &F,
) -> (CaseOutcome, Option<f64>, Option<f64>, bool)
where
    F: Fn(&TestCase) -> Fut,
    Fut: std::future::Future<Output = Result<CaseAttempt, CircuitBreakerError>>,
{
    let mut outcome = CaseOutcome::Errored;
    let mut disconnected = false;
    let mut start_ms = None;
    let mut first_output_ms = None;
    for _attempt in 0..=config.retry_count {
        match exec(case).await {
            Ok(attempt) => {
                outcome = attempt.outcome;
                disconnected = attempt.disconnected;
                start_ms = attempt.session_start_ms.or(start_ms);
                first_output_ms = attempt.time_to_first_output_ms.or(first_output_ms);
                if !matches!(outcome, CaseOutcome::TimedOut | CaseOutcome::Errored) {
                    break;
                }
            }
            Err(_) => outcome = CaseOutcome::Errored,
        }
    }
    (outcome, start_ms, first_output_ms, disconnected)
}

pub struct CaseAttempt {
    pub outcome: CaseOutcome,
    pub session_start_ms: Option<f64>,
    pub time_to_first_output_ms: Option<f64>,
    pub disconnected: bool,
}

fn overall_status(outcomes: &[CaseOutcome], timed_out: bool) -> CanaryStatus {
    if timed_out || outcomes.iter().any(|o| *o == CaseOutcome::TimedOut) {
        return CanaryStatus::TimedOut;
    }
    if outcomes.iter().any(|o| *o == CaseOutcome::Errored) {
        return CanaryStatus::Errored;
    }
    if outcomes.iter().any(|o| *o == CaseOutcome::Failed) {
        return CanaryStatus::Failed;
    }
    CanaryStatus::Passed
}

fn aggregate(outcomes: &[CaseOutcome], starts: &[f64], firsts: &[f64], disconnects: &[bool]) -> CanaryMetrics {
    let total = outcomes.len() as u32;
    let passed = outcomes.iter().filter(|o| **o == CaseOutcome::Passed).count() as u32;
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, CaseOutcome::Failed | CaseOutcome::TimedOut))
        .count() as u32;
    let errored = outcomes.iter().filter(|o| **o == CaseOutcome::Errored).count() as u32;
    let skipped = outcomes.iter().filter(|o| **o == CaseOutcome::Skipped).count() as u32;
    let pass_rate = if total == 0 { 0.0 } else { passed as f64 / total as f64 };
    let avg = |xs: &[f64]| if xs.is_empty() { 0.0 } else { xs.iter().sum::<f64>() / xs.len() as f64 };
    let disconnect_rate = if disconnects.is_empty() {
        0.0
    } else {
        disconnects.iter().filter(|d| **d).count() as f64 / disconnects.len() as f64
    };
    CanaryMetrics {
        total_tests: total,
        passed,
        failed,
        errored,
        skipped,
        pass_rate,
        avg_session_start_ms: avg(starts),
        avg_time_to_first_output_ms: avg(firsts),
        disconnect_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CanaryConfig {
        CanaryConfig { max_concurrency: 4, default_timeout_ms: 5_000, retry_count: 1, continue_on_failure: true }
    }

    #[tokio::test]
    async fn all_passing_cases_yield_passed_status() {
        let cases = vec![TestCase { name: "a".into(), providers: vec![ProviderId::Codex] }];
        let result = run_suite("golden_path", &cases, ProviderId::Codex, &config(), |_| async {
            Ok(CaseAttempt {
                outcome: CaseOutcome::Passed,
                session_start_ms: Some(100.0),
                time_to_first_output_ms: Some(50.0),
                disconnected: false,
            })
        })
        .await;
        assert_eq!(result.status, CanaryStatus::Passed);
        assert_eq!(result.metrics.pass_rate, 1.0);
    }

    #[tokio::test]
    async fn error_outranks_failed_in_overall_status() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let cases = vec![
            TestCase { name: "a".into(), providers: vec![ProviderId::Codex] },
            TestCase { name: "b".into(), providers: vec![ProviderId::Codex] },
        ];
        let call = AtomicU32::new(0);
        let result = run_suite("adapter_contract", &cases, ProviderId::Codex, &config(), |_| {
            let n = call.fetch_add(1, Ordering::SeqCst);
            let is_first_case = n < 2; // both attempts of case a fail
            async move {
                Ok(CaseAttempt {
                    outcome: if is_first_case { CaseOutcome::Failed } else { CaseOutcome::Errored },
                    session_start_ms: None,
                    time_to_first_output_ms: None,
                    disconnected: false,
                })
            }
        })
        .await;
        assert_eq!(result.status, CanaryStatus::Errored);
    }

    #[tokio::test]
    async fn cases_within_a_chunk_run_concurrently() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let in_flight = std::sync::Arc::new(AtomicU32::new(0));
        let max_in_flight = std::sync::Arc::new(AtomicU32::new(0));
        let cases: Vec<TestCase> =
            (0..4).map(|i| TestCase { name: format!("c{i}"), providers: vec![ProviderId::Codex] }).collect();
        let cfg = CanaryConfig { max_concurrency: 4, default_timeout_ms: 5_000, retry_count: 0, continue_on_failure: true };
        let result = run_suite("golden_path", &cases, ProviderId::Codex, &cfg, {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            move |_| {
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(CaseAttempt { outcome: CaseOutcome::Passed, session_start_ms: None, time_to_first_output_ms: None, disconnected: false })
                }
            }
        })
        .await;
        assert_eq!(result.metrics.total_tests, 4);
        assert!(max_in_flight.load(Ordering::SeqCst) > 1, "expected cases to overlap within a chunk");
    }

    #[tokio::test]
    async fn disconnects_are_reflected_in_disconnect_rate() {
        let cases = vec![
            TestCase { name: "a".into(), providers: vec![ProviderId::Codex] },
            TestCase { name: "b".into(), providers: vec![ProviderId::Codex] },
        ];
        use std::sync::atomic::{AtomicU32, Ordering};
        let call = AtomicU32::new(0);
        let result = run_suite("golden_path", &cases, ProviderId::Codex, &config(), |_| {
            let n = call.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(CaseAttempt {
                    outcome: CaseOutcome::Passed,
                    session_start_ms: Some(10.0),
                    time_to_first_output_ms: Some(5.0),
                    disconnected: n == 0,
                })
            }
        })
        .await;
        assert_eq!(result.metrics.disconnect_rate, 0.5);
    }

    #[tokio::test]
    async fn canary_manager_records_a_real_run() {
        let mgr = CanaryManager::new();
        let cases = default_suite_cases("golden_path", ProviderId::Codex);
        let run_id = mgr
            .trigger_run("build-1".into(), "golden_path", &cases, ProviderId::Codex, &config(), |_| async {
                Ok(CaseAttempt {
                    outcome: CaseOutcome::Passed,
                    session_start_ms: Some(10.0),
                    time_to_first_output_ms: Some(5.0),
                    disconnected: false,
                })
            })
            .await;
        let record = mgr.get(run_id).expect("run recorded");
        assert_eq!(record.build_id, "build-1");
        assert_eq!(record.result.status, CanaryStatus::Passed);
        assert!(mgr.get(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn unrelated_providers_are_filtered_out() {
        let cases = vec![TestCase { name: "a".into(), providers: vec![ProviderId::GeminiCli] }];
        let result = run_suite("metering", &cases, ProviderId::Codex, &config(), |_| async {
            Ok(CaseAttempt {
                outcome: CaseOutcome::Passed,
                session_start_ms: None,
                time_to_first_output_ms: None,
                disconnected: false,
            })
        })
        .await;
        assert_eq!(result.metrics.total_tests, 0);
        assert_eq!(result.status, CanaryStatus::Passed);
    }
}
