use anyhow::{Context, Result};
use async_trait::async_trait;
use codebus_core::{
    config::{DownstreamConfig, SyncConfig},
    models::JobState,
    util::{code_key, site_key},
};
use serde::Serialize;

use crate::fstab::Fstab;

/// Work a phase asks the caller to perform against downstream services.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SideEffect {
    /// Purge cached responses by resource path and/or surrogate key.
    Purge { owner: String, repo: String, ref_name: String, paths: Vec<String>, keys: Vec<String> },
    DeployMountTable { owner: String, repo: String, fstab: Fstab },
    MergeContentConfig { owner: String, repo: String },
    Reindex { owner: String, repo: String },
}

/// Downstream services notified by a job.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn purge(
        &self,
        owner: &str,
        repo: &str,
        ref_name: &str,
        paths: &[String],
        keys: &[String],
    ) -> Result<()>;

    async fn deploy_mount_table(&self, owner: &str, repo: &str, fstab: &Fstab) -> Result<()>;

    async fn merge_content_config(&self, owner: &str, repo: &str) -> Result<()>;

    async fn reindex(&self, owner: &str, repo: &str) -> Result<()>;
}

/// Execute side effects in order. Failures are logged and never abort the job.
pub async fn execute(downstream: &dyn Downstream, effects: &[SideEffect]) {
    for effect in effects {
        let result = match effect {
            SideEffect::Purge { owner, repo, ref_name, paths, keys } => {
                downstream.purge(owner, repo, ref_name, paths, keys).await
            }
            SideEffect::DeployMountTable { owner, repo, fstab } => {
                downstream.deploy_mount_table(owner, repo, fstab).await
            }
            SideEffect::MergeContentConfig { owner, repo } => {
                downstream.merge_content_config(owner, repo).await
            }
            SideEffect::Reindex { owner, repo } => downstream.reindex(owner, repo).await,
        };
        if let Err(e) = result {
            tracing::error!("Failed to execute {:?}: {:?}", effect, e);
        }
    }
}

/// Compute the cache purge for a finished sync.
///
/// A removed branch purges its site and code keys. Otherwise every changed
/// resource path is purged, or the branch code key once there are more than
/// `purge_path_limit` of them.
pub fn flush_cache(state: &JobState, config: &SyncConfig) -> Vec<SideEffect> {
    let data = &state.data;
    let purge = |paths: Vec<String>, keys: Vec<String>| SideEffect::Purge {
        owner: data.owner.clone(),
        repo: data.repo.clone(),
        ref_name: data.ref_name.clone(),
        paths,
        keys,
    };
    if data.delete_tree {
        return vec![purge(vec![], vec![
            site_key(&data.owner, &data.repo, &data.ref_name),
            code_key(&data.owner, &data.repo, &data.ref_name),
        ])];
    }
    let paths = state
        .resources
        .iter()
        .filter(|r| r.is_changed())
        .map(|r| r.resource_path.clone())
        .collect::<Vec<_>>();
    if paths.is_empty() {
        vec![]
    } else if paths.len() > config.purge_path_limit {
        vec![purge(vec![], vec![code_key(&data.owner, &data.repo, &data.ref_name)])]
    } else {
        vec![purge(paths, vec![])]
    }
}

/// Downstream services reached over HTTP. Endpoints that are not configured are skipped.
pub struct HttpDownstream {
    client: reqwest::Client,
    config: DownstreamConfig,
}

#[derive(Serialize)]
struct PurgeRequest<'a> {
    owner: &'a str,
    repo: &'a str,
    #[serde(rename = "ref")]
    ref_name: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    paths: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    keys: &'a [String],
}

fn is_empty(values: &&[String]) -> bool { values.is_empty() }

impl HttpDownstream {
    pub fn new(config: DownstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build().context("Failed to create HTTP client")?;
        Ok(Self { client, config })
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<()> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .with_context(|| format!("Failed to call {url}"))?
            .error_for_status()
            .with_context(|| format!("Request to {url} failed"))?;
        Ok(())
    }
}

fn endpoint(base: &Option<String>, what: &str) -> Option<String> {
    match base {
        Some(url) => Some(url.trim_end_matches('/').to_string()),
        None => {
            tracing::debug!("No {what} endpoint configured, skipping");
            None
        }
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn purge(
        &self,
        owner: &str,
        repo: &str,
        ref_name: &str,
        paths: &[String],
        keys: &[String],
    ) -> Result<()> {
        let Some(url) = endpoint(&self.config.purge_url, "purge") else {
            return Ok(());
        };
        tracing::info!(owner, repo, ref_name, paths = paths.len(), keys = ?keys, "Purging cache");
        self.post(&url, &PurgeRequest { owner, repo, ref_name, paths, keys }).await
    }

    async fn deploy_mount_table(&self, owner: &str, repo: &str, fstab: &Fstab) -> Result<()> {
        let Some(url) = endpoint(&self.config.fstab_url, "mount table") else {
            return Ok(());
        };
        self.post(&format!("{url}/{owner}/{repo}"), fstab).await
    }

    async fn merge_content_config(&self, owner: &str, repo: &str) -> Result<()> {
        let Some(url) = endpoint(&self.config.content_config_url, "content config") else {
            return Ok(());
        };
        self.post(&format!("{url}/{owner}/{repo}"), &serde_json::json!({})).await
    }

    async fn reindex(&self, owner: &str, repo: &str) -> Result<()> {
        let Some(url) = endpoint(&self.config.discovery_url, "discovery") else {
            return Ok(());
        };
        self.post(&format!("{url}/{owner}/{repo}"), &serde_json::json!({})).await
    }
}
