use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.fleet-control/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub update_pipeline: UpdatePipelineConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            session: SessionConfig::default(),
            fleet: FleetConfig::default(),
            update_pipeline: UpdatePipelineConfig::default(),
            realtime: RealtimeConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.fleet-control/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".fleet-control")
            .join("config.toml")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// General
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_project_name() -> String {
    "fleet-control".into()
}
fn default_log_level() -> String {
    "info".into()
}

// ---------------------------------------------------------------------------
// Session Coordinator (spec §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_sessions_per_org")]
    pub max_sessions_per_org: u32,
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u32,
    #[serde(default = "default_session_ttl_hours")]
    pub session_data_ttl_hours: u32,
    #[serde(default = "default_audit_log_cap")]
    pub audit_log_cap: usize,
    #[serde(default = "default_placement_retries")]
    pub placement_retries: u32,
    /// How long a session stays observably STOPPING before the coordinator
    /// completes the stop. A second `stop()` call inside this window is
    /// idempotent rather than erroring.
    #[serde(default = "default_stop_grace_period_ms")]
    pub stop_grace_period_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_org: default_max_sessions_per_org(),
            default_timeout_minutes: default_timeout_minutes(),
            session_data_ttl_hours: default_session_ttl_hours(),
            audit_log_cap: default_audit_log_cap(),
            placement_retries: default_placement_retries(),
            stop_grace_period_ms: default_stop_grace_period_ms(),
        }
    }
}

fn default_max_sessions_per_org() -> u32 {
    20
}
fn default_timeout_minutes() -> u32 {
    60
}
fn default_session_ttl_hours() -> u32 {
    72
}
fn default_audit_log_cap() -> usize {
    200
}
fn default_placement_retries() -> u32 {
    3
}
fn default_stop_grace_period_ms() -> u64 {
    2000
}

// ---------------------------------------------------------------------------
// Fleet Manager (spec §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_max_runners")]
    pub max_runners: u32,
    #[serde(default = "default_load_factor")]
    pub load_factor: f64,
    #[serde(default = "default_offline_grace_multiplier")]
    pub offline_grace_multiplier: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_runners: default_max_runners(),
            load_factor: default_load_factor(),
            offline_grace_multiplier: default_offline_grace_multiplier(),
        }
    }
}

fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}
fn default_health_check_interval_ms() -> u64 {
    5_000
}
fn default_max_runners() -> u32 {
    500
}
fn default_load_factor() -> f64 {
    0.9
}
fn default_offline_grace_multiplier() -> u32 {
    2
}

// ---------------------------------------------------------------------------
// Update Pipeline (spec §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionWatcherConfig {
    #[serde(default = "default_check_interval_ms")]
    pub default_check_interval_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

impl Default for VersionWatcherConfig {
    fn default() -> Self {
        Self {
            default_check_interval_ms: default_check_interval_ms(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

fn default_check_interval_ms() -> u64 {
    300_000
}
fn default_http_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    #[serde(default = "default_canary_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_canary_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_canary_concurrency(),
            default_timeout_ms: default_canary_timeout_ms(),
            retry_count: default_retry_count(),
            continue_on_failure: true,
        }
    }
}

fn default_canary_concurrency() -> u32 {
    4
}
fn default_canary_timeout_ms() -> u64 {
    600_000
}
fn default_retry_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_max_versions_per_provider")]
    pub max_versions_per_provider: u32,
    #[serde(default = "default_max_builds")]
    pub max_builds: u32,
    #[serde(default = "default_auto_deprecate_days")]
    pub auto_deprecate_days: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_versions_per_provider: default_max_versions_per_provider(),
            max_builds: default_max_builds(),
            auto_deprecate_days: default_auto_deprecate_days(),
        }
    }
}

fn default_max_versions_per_provider() -> u32 {
    50
}
fn default_max_builds() -> u32 {
    200
}
fn default_auto_deprecate_days() -> u32 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackThresholds {
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    #[serde(default = "default_max_disconnect_rate")]
    pub max_disconnect_rate: f64,
    #[serde(default = "default_min_session_count")]
    pub min_session_count: u32,
}

impl Default for RollbackThresholds {
    fn default() -> Self {
        Self {
            max_failure_rate: default_max_failure_rate(),
            max_disconnect_rate: default_max_disconnect_rate(),
            min_session_count: default_min_session_count(),
        }
    }
}

fn default_max_failure_rate() -> f64 {
    0.10
}
fn default_max_disconnect_rate() -> f64 {
    0.10
}
fn default_min_session_count() -> u32 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    #[serde(default = "default_max_concurrent_rollouts")]
    pub max_concurrent_rollouts: u32,
    #[serde(default = "default_rollout_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_true")]
    pub auto_progress: bool,
    #[serde(default)]
    pub rollback_thresholds: RollbackThresholds,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            max_concurrent_rollouts: default_max_concurrent_rollouts(),
            check_interval_ms: default_rollout_check_interval_ms(),
            auto_progress: true,
            rollback_thresholds: RollbackThresholds::default(),
        }
    }
}

fn default_max_concurrent_rollouts() -> u32 {
    5
}
fn default_rollout_check_interval_ms() -> u64 {
    60_000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_max_concurrent_sweeps")]
    pub max_concurrent_sweeps: u32,
    #[serde(default = "default_sweep_rate_limit")]
    pub default_rate_limit: u32,
    #[serde(default = "default_max_repos_per_run")]
    pub default_max_repos_per_run: u32,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sweeps: default_max_concurrent_sweeps(),
            default_rate_limit: default_sweep_rate_limit(),
            default_max_repos_per_run: default_max_repos_per_run(),
            enabled: false,
        }
    }
}

fn default_max_concurrent_sweeps() -> u32 {
    2
}
fn default_sweep_rate_limit() -> u32 {
    10
}
fn default_max_repos_per_run() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePipelineConfig {
    /// Whether a newly discovered version automatically gets a canary run
    /// (against `FleetManager::select`'s placement check) rather than only
    /// running on an explicit `/api/canary/runs` call.
    #[serde(default)]
    pub auto_canary: bool,
    /// Whether `checkAndProgressRollouts` runs at all as a background job.
    #[serde(default)]
    pub auto_rollout: bool,
    #[serde(default)]
    pub version_watcher: VersionWatcherConfig,
    #[serde(default)]
    pub canary: CanaryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl Default for UpdatePipelineConfig {
    fn default() -> Self {
        Self {
            auto_canary: true,
            auto_rollout: true,
            version_watcher: VersionWatcherConfig::default(),
            canary: CanaryConfig::default(),
            registry: RegistryConfig::default(),
            rollout: RolloutConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Realtime Hub (spec §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_message_size: default_max_message_size(),
            max_connections_per_user: default_max_connections_per_user(),
        }
    }
}

fn default_ping_interval_ms() -> u64 {
    30_000
}
fn default_connection_timeout_ms() -> u64 {
    90_000
}
fn default_max_message_size() -> usize {
    1 << 20
}
fn default_max_connections_per_user() -> u32 {
    10
}

// ---------------------------------------------------------------------------
// Daemon / transport binding (ADDED, spec §6.1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_daemon_port(),
            host: default_daemon_host(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

fn default_daemon_port() -> u16 {
    8700
}
fn default_daemon_host() -> String {
    "127.0.0.1".into()
}

/// Per-tier request budgets for the API's `MultiKeyRateLimiter` (spec §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_rpm")]
    pub global_requests_per_minute: u64,
    #[serde(default = "default_per_user_rpm")]
    pub per_user_requests_per_minute: u64,
    #[serde(default = "default_per_endpoint_rpm")]
    pub per_endpoint_requests_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_requests_per_minute: default_global_rpm(),
            per_user_requests_per_minute: default_per_user_rpm(),
            per_endpoint_requests_per_minute: default_per_endpoint_rpm(),
        }
    }
}

fn default_global_rpm() -> u64 {
    6000
}
fn default_per_user_rpm() -> u64 {
    600
}
fn default_per_endpoint_rpm() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.session.max_sessions_per_org, cfg.session.max_sessions_per_org);
        assert_eq!(parsed.fleet.heartbeat_timeout_ms, cfg.fleet.heartbeat_timeout_ms);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let parsed: Config = toml::from_str("").unwrap();
        assert_eq!(parsed.session.max_sessions_per_org, default_max_sessions_per_org());
        assert_eq!(parsed.realtime.max_connections_per_user, default_max_connections_per_user());
    }
}
