use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub downstream: DownstreamConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub token: String,
    pub app: Option<GitHubAppConfig>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_raw_url")]
    pub raw_url: String,
}

fn default_api_url() -> String { "https://api.github.com".to_string() }

fn default_raw_url() -> String { "https://raw.githubusercontent.com".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubAppConfig {
    pub id: u64,
    pub webhook_secret: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub code_bus: StoreConfig,
    pub content_bus: StoreConfig,
    pub jobs: StoreConfig,
}

/// Location of an object store, e.g. `s3://bucket/prefix`, `file:///var/lib/codebus`
/// or `memory://`. Options are passed through to the store builder.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub url: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Branch whose storage must never be removed and which owns the project configuration.
    pub default_branch: String,
    /// Worker count for calls against the rate-limited source-control API.
    pub upstream_concurrency: usize,
    /// Worker count for purely internal storage operations.
    pub storage_concurrency: usize,
    /// Time one invocation may spend waiting for rate limits before the job is left for a later run.
    pub max_retry_wait_secs: u64,
    /// Wait used when a rate-limited response carries no usable reset information.
    pub default_rate_limit_wait_secs: u64,
    /// Above this many changed paths, flushing purges the branch code key instead.
    pub purge_path_limit: usize,
    pub preview_domain: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            upstream_concurrency: 4,
            storage_concurrency: 32,
            max_retry_wait_secs: 900,
            default_rate_limit_wait_secs: 60,
            purge_path_limit: 500,
            preview_domain: "aem.page".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn max_retry_wait(&self) -> Duration { Duration::from_secs(self.max_retry_wait_secs) }

    pub fn default_rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.default_rate_limit_wait_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DownstreamConfig {
    pub purge_url: Option<String>,
    pub discovery_url: Option<String>,
    pub content_config_url: Option<String>,
    pub fstab_url: Option<String>,
    pub token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: Config = serde_yaml::from_str(
            r#"
server:
  port: 3000
github:
  token: ghp_test
storage:
  code_bus: { url: "memory://" }
  content_bus: { url: "memory://" }
  jobs: { url: "file:///tmp/jobs" }
"#,
        )
        .unwrap();
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.sync.default_branch, "main");
        assert_eq!(config.sync.upstream_concurrency, 4);
        assert!(config.downstream.purge_url.is_none());
        assert!(config.storage.code_bus.options.is_empty());
    }

    #[test]
    fn test_partial_sync_config() {
        let sync: SyncConfig =
            serde_yaml::from_str("default_branch: trunk\nmax_retry_wait_secs: 5\n").unwrap();
        assert_eq!(sync.default_branch, "trunk");
        assert_eq!(sync.max_retry_wait(), Duration::from_secs(5));
        assert_eq!(sync.storage_concurrency, 32);
    }
}
