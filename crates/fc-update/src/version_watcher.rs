use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fc_core::config::VersionWatcherConfig;
use fc_core::types::{ProviderId, VersionRecord};
use fc_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

use crate::sources::VersionSource;

/// One emitted fact: either a new version was discovered, or the check
/// itself failed (the known version is left untouched in the latter case).
#[derive(Debug, Clone)]
pub enum WatchEvent {
    VersionDiscovered { provider_id: ProviderId, version: String, previous_version: Option<String>, source_url: Option<String> },
    CheckError { provider_id: ProviderId, source_url: String, message: String },
}

struct Watched {
    provider_id: ProviderId,
    source: Box<dyn VersionSource>,
    breaker: CircuitBreaker,
}

/// Polls upstream sources and raises `version_discovered`/`check_error`
/// events when a provider's latest known version changes (spec §4.3.1).
pub struct VersionWatcher {
    config: VersionWatcherConfig,
    sources: Vec<Watched>,
    last_known: DashMap<ProviderId, String>,
}

impl VersionWatcher {
    pub fn new(config: VersionWatcherConfig) -> Self {
        Self { config, sources: Vec::new(), last_known: DashMap::new() }
    }

    pub fn add_source(&mut self, provider_id: ProviderId, source: Box<dyn VersionSource>) {
        self.sources.push(Watched {
            provider_id,
            source,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
        });
    }

    /// Records a version observed via Fleet Manager heartbeats, bypassing
    /// the upstream fetch entirely (`RegisterHeartbeatVersion`).
    pub fn register_heartbeat_version(&self, provider_id: ProviderId, version: String) -> Option<WatchEvent> {
        self.note_version(provider_id, version, None)
    }

    fn note_version(&self, provider_id: ProviderId, version: String, source_url: Option<String>) -> Option<WatchEvent> {
        let previous = self.last_known.insert(provider_id, version.clone());
        if previous.as_deref() == Some(version.as_str()) {
            return None;
        }
        Some(WatchEvent::VersionDiscovered { provider_id, version, previous_version: previous, source_url })
    }

    /// Check every configured source once. Each fetch is wrapped in its own
    /// circuit breaker and bounded by `http_timeout_ms`; a consistently
    /// failing source degrades to repeated `check_error` without ever
    /// blocking the other sources' polls.
    pub async fn check_all(&self) -> Vec<WatchEvent> {
        let mut events = Vec::with_capacity(self.sources.len());
        for watched in &self.sources {
            let timeout = Duration::from_millis(self.config.http_timeout_ms);
            let fetch = watched.breaker.call(|| async {
                tokio::time::timeout(timeout, watched.source.fetch_latest())
                    .await
                    .map_err(|_| anyhow::anyhow!("source check timed out"))?
            });

            match fetch.await {
                Ok(fetched) => {
                    if let Some(ev) = self.note_version(watched.provider_id, fetched.version, Some(fetched.source_url)) {
                        events.push(ev);
                    }
                }
                Err(err) => {
                    events.push(WatchEvent::CheckError {
                        provider_id: watched.provider_id,
                        source_url: String::new(),
                        message: err.to_string(),
                    });
                }
            }
        }
        events
    }

    pub fn known_version(&self, provider_id: ProviderId) -> Option<String> {
        self.last_known.get(&provider_id).map(|v| v.clone())
    }

    pub fn to_version_record(provider_id: ProviderId, version: String, source_url: Option<String>) -> VersionRecord {
        VersionRecord {
            provider_id,
            version,
            released_at: Utc::now(),
            source_url,
            checksum: None,
            canary_passed: false,
            canary_passed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::FetchedVersion;

    struct FixedSource(&'static str);

    #[async_trait::async_trait]
    impl VersionSource for FixedSource {
        async fn fetch_latest(&self) -> anyhow::Result<FetchedVersion> {
            Ok(FetchedVersion { version: self.0.to_string(), source_url: "https://example.invalid".to_string() })
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl VersionSource for FailingSource {
        async fn fetch_latest(&self) -> anyhow::Result<FetchedVersion> {
            Err(anyhow::anyhow!("upstream unavailable"))
        }
    }

    fn config() -> VersionWatcherConfig {
        VersionWatcherConfig { default_check_interval_ms: 60_000, http_timeout_ms: 2_000 }
    }

    #[tokio::test]
    async fn first_check_emits_discovery_with_no_previous() {
        let mut watcher = VersionWatcher::new(config());
        watcher.add_source(ProviderId::Codex, Box::new(FixedSource("1.0.0")));
        let events = watcher.check_all().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            WatchEvent::VersionDiscovered { previous_version: None, version, .. } if version == "1.0.0"
        ));
    }

    #[tokio::test]
    async fn unchanged_version_emits_nothing() {
        let mut watcher = VersionWatcher::new(config());
        watcher.add_source(ProviderId::Codex, Box::new(FixedSource("1.0.0")));
        watcher.check_all().await;
        let events = watcher.check_all().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn failing_source_emits_check_error_and_keeps_known_version() {
        let mut watcher = VersionWatcher::new(config());
        watcher.add_source(ProviderId::Codex, Box::new(FailingSource));
        let events = watcher.check_all().await;
        assert!(matches!(&events[0], WatchEvent::CheckError { .. }));
        assert_eq!(watcher.known_version(ProviderId::Codex), None);
    }

    #[test]
    fn heartbeat_registration_reports_change() {
        let watcher = VersionWatcher::new(config());
        assert!(watcher.register_heartbeat_version(ProviderId::Codex, "2.0.0".into()).is_some());
        assert!(watcher.register_heartbeat_version(ProviderId::Codex, "2.0.0".into()).is_none());
    }
}
