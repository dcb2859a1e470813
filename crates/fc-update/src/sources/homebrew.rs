use serde::Deserialize;

use super::{FetchedVersion, VersionSource};

#[derive(Deserialize)]
struct HomebrewFormula {
    versions: HomebrewVersions,
}

#[derive(Deserialize)]
struct HomebrewVersions {
    stable: String,
}

/// Fetches `versions.stable` from the homebrew formula JSON endpoint.
pub struct HomebrewSource {
    pub formula: String,
}

impl HomebrewSource {
    pub fn new(formula: impl Into<String>) -> Self {
        Self { formula: formula.into() }
    }
}

#[async_trait::async_trait]
impl VersionSource for HomebrewSource {
    async fn fetch_latest(&self) -> anyhow::Result<FetchedVersion> {
        let url = format!("https://formulae.brew.sh/api/formula/{}.json", self.formula);
        let body: HomebrewFormula = reqwest::get(&url).await?.error_for_status()?.json().await?;
        Ok(FetchedVersion { version: body.versions.stable, source_url: url })
    }
}
