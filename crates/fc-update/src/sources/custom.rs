use serde_json::Value;

use super::{FetchedVersion, VersionSource};

/// Generic JSON-path fetcher for upstream sources that don't fit the npm,
/// github_releases, or homebrew shapes. `json_path` is a dotted path into the
/// response body, e.g. `"data.latest.version"`.
pub struct CustomSource {
    pub url: String,
    pub json_path: String,
}

impl CustomSource {
    pub fn new(url: impl Into<String>, json_path: impl Into<String>) -> Self {
        Self { url: url.into(), json_path: json_path.into() }
    }
}

fn dig<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |cur, key| cur.get(key))
}

#[async_trait::async_trait]
impl VersionSource for CustomSource {
    async fn fetch_latest(&self) -> anyhow::Result<FetchedVersion> {
        let body: Value = reqwest::get(&self.url).await?.error_for_status()?.json().await?;
        let version = dig(&body, &self.json_path)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("json path {} not found in response from {}", self.json_path, self.url))?
            .to_string();
        Ok(FetchedVersion { version, source_url: self.url.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dig_walks_nested_path() {
        let body = json!({ "data": { "latest": { "version": "1.4.0" } } });
        assert_eq!(dig(&body, "data.latest.version").unwrap().as_str(), Some("1.4.0"));
    }

    #[test]
    fn dig_returns_none_for_missing_path() {
        let body = json!({ "data": {} });
        assert!(dig(&body, "data.latest.version").is_none());
    }
}
