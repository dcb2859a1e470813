use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ProviderID / Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Codex,
    ClaudeCode,
    GeminiCli,
    Omnara,
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderId::Codex => "codex",
            ProviderId::ClaudeCode => "claude_code",
            ProviderId::GeminiCli => "gemini_cli",
            ProviderId::Omnara => "omnara",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stable,
    Beta,
    Pinned,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Channel::Stable => "stable",
            Channel::Beta => "beta",
            Channel::Pinned => "pinned",
        };
        write!(f, "{label}")
    }
}

/// Fixed per-channel rollout configuration. These values are policy, not
/// runtime state, and never change at runtime.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub requires_canary: bool,
    pub canary_threshold: f64,
    pub stages: &'static [u8],
    pub rollout_delay_hours: u32,
}

pub fn channel_config(channel: Channel) -> ChannelConfig {
    match channel {
        Channel::Stable => ChannelConfig {
            requires_canary: true,
            canary_threshold: 0.95,
            stages: &[1, 10, 50, 100],
            rollout_delay_hours: 24,
        },
        Channel::Beta => ChannelConfig {
            requires_canary: true,
            canary_threshold: 0.80,
            stages: &[10, 50, 100],
            rollout_delay_hours: 6,
        },
        Channel::Pinned => ChannelConfig {
            requires_canary: false,
            canary_threshold: 0.0,
            stages: &[100],
            rollout_delay_hours: 0,
        },
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    PreparingWorkspace,
    StartingProvider,
    Running,
    WaitingForApproval,
    PausedByHuman,
    Stopping,
    Completed,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::TimedOut
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Created => "CREATED",
            SessionState::PreparingWorkspace => "PREPARING_WORKSPACE",
            SessionState::StartingProvider => "STARTING_PROVIDER",
            SessionState::Running => "RUNNING",
            SessionState::WaitingForApproval => "WAITING_FOR_APPROVAL",
            SessionState::PausedByHuman => "PAUSED_BY_HUMAN",
            SessionState::Stopping => "STOPPING",
            SessionState::Completed => "COMPLETED",
            SessionState::Failed => "FAILED",
            SessionState::TimedOut => "TIMED_OUT",
        };
        write!(f, "{label}")
    }
}

/// Records which path produced a terminal transition — an explicit `Stop`
/// call or a runner-reported terminal state. See DESIGN.md open-question
/// decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    ExplicitStop,
    RunnerReported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRef {
    pub url: String,
    pub branch: String,
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub path: String,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub api_calls: u64,
    pub compute_seconds: u64,
}

impl Usage {
    /// Merge a reported delta. Usage is monotonically non-decreasing (I4),
    /// so a delta is always added, never substituted.
    pub fn add(&mut self, delta: Usage) {
        self.tokens_in += delta.tokens_in;
        self.tokens_out += delta.tokens_out;
        self.api_calls += delta.api_calls;
        self.compute_seconds += delta.compute_seconds;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub org_id: String,
    pub provider_id: ProviderId,
    pub repo: RepoRef,
    pub workspace: Option<WorkspaceRef>,
    pub task: Option<String>,
    pub runner_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub usage: Usage,
    pub state: SessionState,
    pub pending_approvals: Vec<ApprovalRequest>,
    pub completion_source: Option<CompletionSource>,
    pub failure_reason: Option<String>,
    /// Effective watchdog deadline in minutes from `started_at`, resolved at
    /// creation time from `options.timeoutMinutes ?? defaultTimeoutMinutes`.
    pub timeout_minutes: u32,
    /// Bounded audit trail; oldest entries are dropped first once `cap` is
    /// reached (see fc-session's admission & audit detail).
    pub log: Vec<SessionLogEntry>,
}

impl Session {
    pub fn new(
        org_id: String,
        provider_id: ProviderId,
        repo: RepoRef,
        task: Option<String>,
        timeout_minutes: u32,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            org_id,
            provider_id,
            repo,
            workspace: None,
            task,
            runner_id: None,
            started_at: Utc::now(),
            completed_at: None,
            usage: Usage::default(),
            state: SessionState::Created,
            pending_approvals: Vec::new(),
            completion_source: None,
            failure_reason: None,
            timeout_minutes,
            log: Vec::new(),
        }
    }

    pub fn push_log(&mut self, cap: usize, message: impl Into<String>) {
        self.log.push(SessionLogEntry {
            at: Utc::now(),
            message: message.into(),
        });
        while self.log.len() > cap {
            self.log.remove(0);
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Merge,
    DepsAdd,
    Secrets,
    Deploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: Uuid,
    pub session_id: Uuid,
    pub action: ApprovalAction,
    pub description: String,
    pub requested_at: DateTime<Utc>,
    pub context: Option<serde_json::Value>,
}

impl ApprovalRequest {
    pub fn new(
        session_id: Uuid,
        action: ApprovalAction,
        description: String,
        context: Option<serde_json::Value>,
    ) -> Self {
        Self {
            approval_id: Uuid::new_v4(),
            session_id,
            action,
            description,
            requested_at: Utc::now(),
            context,
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Online,
    Offline,
    Draining,
    Maintenance,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerCapabilities {
    pub providers: Vec<ProviderId>,
    pub max_concurrent_sessions: u32,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunnerLoad {
    pub active_sessions: u32,
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub disk_pct: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub runner_id: Uuid,
    pub hostname: String,
    pub status: RunnerStatus,
    pub capabilities: RunnerCapabilities,
    pub load: RunnerLoad,
    pub runtime_versions: HashMap<ProviderId, String>,
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub assigned_sessions: Vec<Uuid>,
}

impl Runner {
    pub fn new(hostname: String, capabilities: RunnerCapabilities, metadata: HashMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            runner_id: Uuid::new_v4(),
            hostname,
            status: RunnerStatus::Online,
            capabilities,
            load: RunnerLoad::default(),
            runtime_versions: HashMap::new(),
            metadata,
            registered_at: now,
            last_heartbeat_at: now,
            assigned_sessions: Vec::new(),
        }
    }

    pub fn utilization(&self) -> f64 {
        if self.capabilities.max_concurrent_sessions == 0 {
            return 1.0;
        }
        self.load.active_sessions as f64 / self.capabilities.max_concurrent_sessions as f64
    }
}

// ---------------------------------------------------------------------------
// Version / Build / BuildEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub provider_id: ProviderId,
    pub version: String,
    pub released_at: DateTime<Utc>,
    pub source_url: Option<String>,
    pub checksum: Option<String>,
    pub canary_passed: bool,
    pub canary_passed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub build_id: String,
    pub runner_version: String,
    pub adapters: Vec<String>,
    pub runtime_versions: HashMap<ProviderId, String>,
    pub built_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Testing,
    KnownGood,
    KnownBad,
    Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Recommended,
    Acceptable,
    NotRecommended,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityStatus {
    Compatible,
    Partial,
    Incompatible,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryMetrics {
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub errored: u32,
    pub skipped: u32,
    pub pass_rate: f64,
    pub avg_session_start_ms: f64,
    pub avg_time_to_first_output_ms: f64,
    pub disconnect_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub build_id: String,
    pub status: CompatibilityStatus,
    pub suite_name: String,
    pub metrics: Option<CanaryMetrics>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEntry {
    pub build: Build,
    pub status: BuildStatus,
    pub recommendation: Recommendation,
    pub compat_results: Vec<CompatibilityResult>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub deprecated_at: Option<DateTime<Utc>>,
    pub deprecation_reason: Option<String>,
}

impl BuildEntry {
    pub fn new(build: Build) -> Self {
        Self {
            build,
            status: BuildStatus::Testing,
            recommendation: Recommendation::NotRecommended,
            compat_results: Vec::new(),
            promoted_at: None,
            deprecated_at: None,
            deprecation_reason: None,
        }
    }

    pub fn has_compatible_result(&self) -> bool {
        self.compat_results
            .iter()
            .any(|r| r.status == CompatibilityStatus::Compatible)
    }
}

// ---------------------------------------------------------------------------
// Rollout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Pending,
    CanaryTesting,
    CanaryPassed,
    CanaryFailed,
    RollingOut,
    Paused,
    Completed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgAssignment {
    pub org_id: String,
    pub from_build_id: Option<String>,
    pub to_build_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    pub rollout_id: Uuid,
    pub target_build_id: String,
    pub channel: Channel,
    pub state: RolloutState,
    pub current_percentage: u8,
    pub target_percentage: u8,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub affected_orgs: Vec<OrgAssignment>,
    pub canary_result_ref: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutEvent {
    pub rollout_id: Uuid,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// OrgRuntimeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnterpriseConfig {
    pub approval_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgRuntimeConfig {
    pub org_id: String,
    pub channel: Channel,
    pub pinned_build_id: Option<String>,
    pub beta_opt_in: bool,
    pub auto_upgrade: bool,
    pub notifications: bool,
    pub enterprise: Option<EnterpriseConfig>,
    pub current_build_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_terminal() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::TimedOut.is_terminal());
        assert!(!SessionState::Running.is_terminal());
    }

    #[test]
    fn usage_is_additive() {
        let mut u = Usage::default();
        u.add(Usage { tokens_in: 10, tokens_out: 5, api_calls: 1, compute_seconds: 2 });
        u.add(Usage { tokens_in: 3, tokens_out: 1, api_calls: 1, compute_seconds: 0 });
        assert_eq!(u.tokens_in, 13);
        assert_eq!(u.api_calls, 2);
    }

    #[test]
    fn channel_configs_match_spec() {
        let stable = channel_config(Channel::Stable);
        assert_eq!(stable.stages, &[1, 10, 50, 100]);
        assert!((stable.canary_threshold - 0.95).abs() < f64::EPSILON);

        let pinned = channel_config(Channel::Pinned);
        assert!(!pinned.requires_canary);
        assert_eq!(pinned.stages, &[100]);
    }

    #[test]
    fn session_log_is_capped() {
        let mut s = Session::new(
            "org1".into(),
            ProviderId::Codex,
            RepoRef { url: "https://x".into(), branch: "main".into(), commit: None },
            None,
            60,
        );
        for i in 0..5 {
            s.push_log(3, format!("entry {i}"));
        }
        assert_eq!(s.log.len(), 3);
        assert_eq!(s.log[0].message, "entry 2");
    }

    #[test]
    fn provider_id_display_matches_wire_form() {
        assert_eq!(ProviderId::ClaudeCode.to_string(), "claude_code");
        assert_eq!(ProviderId::GeminiCli.to_string(), "gemini_cli");
    }
}
