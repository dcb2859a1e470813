use super::{FetchedVersion, VersionSource};

/// Lists releases via `octocrab` and takes the latest non-prerelease tag.
pub struct GithubReleasesSource {
    pub owner: String,
    pub repo: String,
}

impl GithubReleasesSource {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self { owner: owner.into(), repo: repo.into() }
    }
}

#[async_trait::async_trait]
impl VersionSource for GithubReleasesSource {
    async fn fetch_latest(&self) -> anyhow::Result<FetchedVersion> {
        let octocrab = octocrab::instance();
        let page = octocrab.repos(&self.owner, &self.repo).releases().list().per_page(20).send().await?;

        let release = page
            .items
            .into_iter()
            .find(|r| !r.prerelease && !r.draft)
            .ok_or_else(|| anyhow::anyhow!("no non-prerelease release found for {}/{}", self.owner, self.repo))?;

        Ok(FetchedVersion { version: release.tag_name, source_url: release.html_url.to_string() })
    }
}
