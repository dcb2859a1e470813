use serde::Deserialize;

use super::{FetchedVersion, VersionSource};

#[derive(Deserialize)]
struct NpmAbbreviated {
    #[serde(rename = "dist-tags")]
    dist_tags: NpmDistTags,
}

#[derive(Deserialize)]
struct NpmDistTags {
    latest: String,
}

/// Fetches `dist-tags.latest` from the npm registry for a package.
pub struct NpmSource {
    pub package: String,
    pub registry_url: String,
}

impl NpmSource {
    pub fn new(package: impl Into<String>) -> Self {
        Self { package: package.into(), registry_url: "https://registry.npmjs.org".to_string() }
    }
}

#[async_trait::async_trait]
impl VersionSource for NpmSource {
    async fn fetch_latest(&self) -> anyhow::Result<FetchedVersion> {
        let url = format!("{}/{}", self.registry_url, self.package);
        let body: NpmAbbreviated = reqwest::get(&url).await?.error_for_status()?.json().await?;
        Ok(FetchedVersion { version: body.dist_tags.latest, source_url: url })
    }
}
