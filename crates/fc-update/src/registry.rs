use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use fc_core::config::RegistryConfig;
use fc_core::types::{
    Build, BuildEntry, BuildStatus, Channel, CompatibilityResult, CompatibilityStatus, ProviderId,
    Recommendation, VersionRecord,
};
use tokio::sync::RwLock;

use crate::error::{Result, UpdateError};

/// Known-good registry (spec §4.3.3): tracks observed versions per provider
/// and build compatibility history, and answers "what should I run" for a
/// channel.
pub struct Registry {
    config: RegistryConfig,
    versions: DashMap<ProviderId, RwLock<Vec<VersionRecord>>>,
    builds: DashMap<String, RwLock<BuildEntry>>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config, versions: DashMap::new(), builds: DashMap::new() }
    }

    pub async fn register_version(&self, record: VersionRecord) {
        let provider = record.provider_id;
        let list = self.versions.entry(provider).or_insert_with(|| RwLock::new(Vec::new()));
        let mut guard = list.write().await;
        guard.push(record);
        guard.sort_by_key(|v| v.released_at);
        let cap = self.config.max_versions_per_provider as usize;
        while guard.len() > cap {
            let Some(victim) = Self::oldest_evictable_index(&self.builds, provider, &guard).await else {
                break;
            };
            guard.remove(victim);
        }
    }

    /// Index of the oldest version that is neither `canary_passed` nor
    /// referenced by any build's `runtime_versions` (spec §4.3.3: evict
    /// oldest *non-referenced*). `versions` is assumed sorted by
    /// `released_at` ascending. Returns `None` if every remaining version is
    /// protected, in which case the cap is temporarily exceeded rather than
    /// evicting a version still backing a build.
    async fn oldest_evictable_index(
        builds: &DashMap<String, RwLock<BuildEntry>>,
        provider: ProviderId,
        versions: &[VersionRecord],
    ) -> Option<usize> {
        for (idx, record) in versions.iter().enumerate() {
            if record.canary_passed {
                continue;
            }
            if Self::version_is_referenced(builds, provider, &record.version).await {
                continue;
            }
            return Some(idx);
        }
        None
    }

    async fn version_is_referenced(builds: &DashMap<String, RwLock<BuildEntry>>, provider: ProviderId, version: &str) -> bool {
        for entry in builds.iter() {
            let guard = entry.value().read().await;
            if guard.build.runtime_versions.get(&provider).is_some_and(|v| v.as_str() == version) {
                return true;
            }
        }
        false
    }

    pub fn register_build(&self, build: Build) -> String {
        let id = build.build_id.clone();
        self.builds.insert(id.clone(), RwLock::new(BuildEntry::new(build)));
        let cap = self.config.max_builds as usize;
        if self.builds.len() > cap {
            self.evict_oldest_non_known_good();
        }
        id
    }

    fn evict_oldest_non_known_good(&self) {
        // collecting (id, built_at) outside the entry-locking loop keeps this
        // O(n) without holding any per-build lock across an await point.
        let mut candidates: Vec<(String, DateTime<Utc>)> = Vec::new();
        for entry in self.builds.iter() {
            if let Ok(guard) = entry.value().try_read() {
                if guard.status != BuildStatus::KnownGood {
                    candidates.push((entry.key().clone(), guard.build.built_at));
                }
            }
        }
        if let Some((oldest_id, _)) = candidates.into_iter().min_by_key(|(_, at)| *at) {
            self.builds.remove(&oldest_id);
        }
    }

    pub async fn add_compatibility_result(&self, build_id: &str, result: CompatibilityResult) -> Result<()> {
        let entry = self.builds.get(build_id).ok_or_else(|| UpdateError::BuildNotFound(build_id.to_string()))?;
        let mut guard = entry.value().write().await;
        guard.recommendation = match result.status {
            CompatibilityStatus::Compatible => Recommendation::Acceptable,
            CompatibilityStatus::Partial => Recommendation::Acceptable,
            CompatibilityStatus::Incompatible => Recommendation::NotRecommended,
            CompatibilityStatus::Unknown => Recommendation::NotRecommended,
        };
        guard.compat_results.push(result);
        Ok(())
    }

    pub async fn promote_build(&self, build_id: &str) -> Result<()> {
        let entry = self.builds.get(build_id).ok_or_else(|| UpdateError::BuildNotFound(build_id.to_string()))?;
        let mut guard = entry.value().write().await;
        if !guard.has_compatible_result() {
            return Err(UpdateError::NotPromotable(build_id.to_string()));
        }
        guard.status = BuildStatus::KnownGood;
        guard.recommendation = Recommendation::Recommended;
        guard.promoted_at = Some(Utc::now());
        Ok(())
    }

    pub async fn deprecate_build(&self, build_id: &str, reason: String) -> Result<()> {
        self.set_bad_or_deprecated(build_id, BuildStatus::Deprecated, reason).await
    }

    pub async fn mark_build_bad(&self, build_id: &str, reason: String) -> Result<()> {
        self.set_bad_or_deprecated(build_id, BuildStatus::KnownBad, reason).await
    }

    async fn set_bad_or_deprecated(&self, build_id: &str, status: BuildStatus, reason: String) -> Result<()> {
        let entry = self.builds.get(build_id).ok_or_else(|| UpdateError::BuildNotFound(build_id.to_string()))?;
        let mut guard = entry.value().write().await;
        guard.status = status;
        guard.deprecated_at = Some(Utc::now());
        guard.deprecation_reason = Some(reason);
        guard.recommendation = Recommendation::Blocked;
        Ok(())
    }

    /// `stable`: most recently promoted known_good with recommendation=recommended.
    /// `beta`/`pinned`: among testing|known_good with recommendation in
    /// {recommended, acceptable}, most recent build time.
    pub async fn recommended_build(&self, channel: Channel) -> Option<Build> {
        let mut best: Option<(DateTime<Utc>, Build)> = None;
        for entry in self.builds.iter() {
            let guard = entry.value().read().await;
            let eligible = match channel {
                Channel::Stable => {
                    guard.status == BuildStatus::KnownGood && guard.recommendation == Recommendation::Recommended
                }
                Channel::Beta | Channel::Pinned => {
                    matches!(guard.status, BuildStatus::Testing | BuildStatus::KnownGood)
                        && matches!(guard.recommendation, Recommendation::Recommended | Recommendation::Acceptable)
                }
            };
            if !eligible {
                continue;
            }
            let rank_at = guard.promoted_at.unwrap_or(guard.build.built_at);
            if best.as_ref().map_or(true, |(at, _)| rank_at > *at) {
                best = Some((rank_at, guard.build.clone()));
            }
        }
        best.map(|(_, b)| b)
    }

    pub async fn get_build(&self, build_id: &str) -> Result<BuildEntry> {
        let entry = self.builds.get(build_id).ok_or_else(|| UpdateError::BuildNotFound(build_id.to_string()))?;
        Ok(entry.value().read().await.clone())
    }

    /// Mark known_good/testing builds older than `auto_deprecate_days` as
    /// deprecated. Never touches a build that's already deprecated/bad.
    pub async fn auto_deprecate(&self, now: DateTime<Utc>) -> Vec<String> {
        let threshold = ChronoDuration::days(self.config.auto_deprecate_days as i64);
        let mut deprecated = Vec::new();
        for entry in self.builds.iter() {
            let id = entry.key().clone();
            let mut guard = entry.value().write().await;
            if matches!(guard.status, BuildStatus::Testing | BuildStatus::KnownGood)
                && now - guard.build.built_at > threshold
            {
                guard.status = BuildStatus::Deprecated;
                guard.deprecated_at = Some(now);
                guard.deprecation_reason = Some("Auto-deprecated due to age.".to_string());
                deprecated.push(id);
            }
        }
        deprecated
    }

    pub async fn versions_for(&self, provider: ProviderId) -> Vec<VersionRecord> {
        match self.versions.get(&provider) {
            Some(list) => list.read().await.clone(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RegistryConfig {
        RegistryConfig { max_versions_per_provider: 5, max_builds: 10, auto_deprecate_days: 30 }
    }

    fn build(id: &str) -> Build {
        Build {
            build_id: id.to_string(),
            runner_version: "1.2.3".to_string(),
            adapters: vec!["codex".to_string()],
            runtime_versions: HashMap::new(),
            built_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    fn compat(build_id: &str, status: CompatibilityStatus) -> CompatibilityResult {
        CompatibilityResult {
            build_id: build_id.to_string(),
            status,
            suite_name: "golden_path".to_string(),
            metrics: None,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn promote_requires_compatible_result() {
        let reg = Registry::new(config());
        reg.register_build(build("b1"));
        assert!(matches!(reg.promote_build("b1").await, Err(UpdateError::NotPromotable(_))));

        reg.add_compatibility_result("b1", compat("b1", CompatibilityStatus::Compatible)).await.unwrap();
        reg.promote_build("b1").await.unwrap();
        let entry = reg.get_build("b1").await.unwrap();
        assert_eq!(entry.status, BuildStatus::KnownGood);
        assert_eq!(entry.recommendation, Recommendation::Recommended);
    }

    #[tokio::test]
    async fn stable_only_recommends_promoted_known_good() {
        let reg = Registry::new(config());
        reg.register_build(build("b1"));
        reg.add_compatibility_result("b1", compat("b1", CompatibilityStatus::Partial)).await.unwrap();
        assert!(reg.recommended_build(Channel::Stable).await.is_none());

        reg.add_compatibility_result("b1", compat("b1", CompatibilityStatus::Compatible)).await.unwrap();
        reg.promote_build("b1").await.unwrap();
        let picked = reg.recommended_build(Channel::Stable).await.unwrap();
        assert_eq!(picked.build_id, "b1");
    }

    #[tokio::test]
    async fn beta_accepts_acceptable_testing_builds() {
        let reg = Registry::new(config());
        reg.register_build(build("b1"));
        reg.add_compatibility_result("b1", compat("b1", CompatibilityStatus::Partial)).await.unwrap();
        let picked = reg.recommended_build(Channel::Beta).await.unwrap();
        assert_eq!(picked.build_id, "b1");
    }

    fn version(version: &str, released_at: DateTime<Utc>, canary_passed: bool) -> VersionRecord {
        VersionRecord {
            provider_id: ProviderId::Codex,
            version: version.to_string(),
            released_at,
            source_url: None,
            checksum: None,
            canary_passed,
            canary_passed_at: None,
        }
    }

    #[tokio::test]
    async fn register_version_evicts_oldest_unreferenced_over_cap() {
        let reg = Registry::new(RegistryConfig { max_versions_per_provider: 2, max_builds: 10, auto_deprecate_days: 30 });
        let base = Utc::now();
        reg.register_version(version("1.0.0", base, false)).await;
        reg.register_version(version("1.1.0", base + ChronoDuration::seconds(1), false)).await;
        reg.register_version(version("1.2.0", base + ChronoDuration::seconds(2), false)).await;

        let versions = reg.versions_for(ProviderId::Codex).await;
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().all(|v| v.version != "1.0.0"));
    }

    #[tokio::test]
    async fn register_version_skips_canary_passed_and_referenced_versions() {
        let reg = Registry::new(RegistryConfig { max_versions_per_provider: 2, max_builds: 10, auto_deprecate_days: 30 });
        let base = Utc::now();

        let mut b = build("b1");
        b.runtime_versions.insert(ProviderId::Codex, "1.0.0".to_string());
        reg.register_build(b);

        reg.register_version(version("1.0.0", base, false)).await;
        reg.register_version(version("1.1.0", base + ChronoDuration::seconds(1), true)).await;
        reg.register_version(version("1.2.0", base + ChronoDuration::seconds(2), false)).await;

        // Both 1.0.0 (referenced by b1) and 1.1.0 (canary_passed) are protected,
        // so the cap of 2 is exceeded rather than evicting either.
        let versions = reg.versions_for(ProviderId::Codex).await;
        assert_eq!(versions.len(), 3);
    }

    #[tokio::test]
    async fn deprecated_build_is_blocked_and_not_recommended() {
        let reg = Registry::new(config());
        reg.register_build(build("b1"));
        reg.add_compatibility_result("b1", compat("b1", CompatibilityStatus::Compatible)).await.unwrap();
        reg.promote_build("b1").await.unwrap();
        reg.deprecate_build("b1", "superseded".into()).await.unwrap();
        assert!(reg.recommended_build(Channel::Stable).await.is_none());
    }
}
