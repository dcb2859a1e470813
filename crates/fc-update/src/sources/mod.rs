mod custom;
mod github_releases;
mod homebrew;
mod npm;

pub use custom::CustomSource;
pub use github_releases::GithubReleasesSource;
pub use homebrew::HomebrewSource;
pub use npm::NpmSource;

/// Result of a single upstream check: the latest version known to that
/// source right now, plus where it came from for the audit trail.
#[derive(Debug, Clone)]
pub struct FetchedVersion {
    pub version: String,
    pub source_url: String,
}

#[async_trait::async_trait]
pub trait VersionSource: Send + Sync {
    async fn fetch_latest(&self) -> anyhow::Result<FetchedVersion>;
}
