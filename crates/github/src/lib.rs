pub mod error;
pub mod rate_limit;
pub mod webhook;

use std::{fmt, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use codebus_core::{config::GitHubConfig, models::RateLimitInfo, util::rfc3339_to_http_date};
use moka::future::Cache;
use octocrab::{Octocrab, models::InstallationId};
use reqwest::{
    RequestBuilder, Response,
    header::{ACCEPT, AUTHORIZATION, LAST_MODIFIED, USER_AGENT},
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

pub use crate::error::UpstreamError;
use crate::rate_limit::{RateLimitTracker, is_exhausted, now, wait_from_headers};

/// Coordinates of a repository.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn new(owner: &str, repo: &str) -> Self {
        Self { owner: owner.to_string(), repo: repo.to_string() }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

#[derive(Debug, Clone)]
pub struct RawFile {
    pub body: Bytes,
    /// `last-modified` as returned by the upstream, in HTTP date format.
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tree {
    pub sha: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(rename = "tree")]
    pub entries: Vec<TreeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl TreeEntry {
    pub fn is_blob(&self) -> bool { self.kind == "blob" }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    InProgress,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub state: DeploymentState,
    pub environment_url: String,
    pub description: String,
}

/// Read access to the upstream repository plus deployment reporting.
#[async_trait]
pub trait CodeSource: Send + Sync {
    /// Recursive tree listing at a commit.
    async fn tree(&self, repo: &RepoRef, sha: &str) -> Result<Tree, UpstreamError>;

    /// Fetch a file through the raw content host.
    async fn raw(&self, repo: &RepoRef, commit: &str, path: &str)
    -> Result<RawFile, UpstreamError>;

    /// Fetch a file through the authenticated repository contents API.
    async fn contents(
        &self,
        repo: &RepoRef,
        git_ref: &str,
        path: &str,
    ) -> Result<RawFile, UpstreamError>;

    /// Date of the most recent commit touching `path`, as an HTTP date.
    async fn last_commit_date(
        &self,
        repo: &RepoRef,
        git_ref: &str,
        path: &str,
    ) -> Result<Option<String>, UpstreamError>;

    async fn branch_head(&self, repo: &RepoRef, branch: &str)
    -> Result<Option<String>, UpstreamError>;

    /// Commit a tag points to, dereferencing annotated tags.
    async fn tag_commit(&self, repo: &RepoRef, tag: &str) -> Result<Option<String>, UpstreamError>;

    async fn rate_limit(&self) -> Result<RateLimitInfo, UpstreamError>;

    async fn create_deployment(
        &self,
        repo: &RepoRef,
        git_ref: &str,
        environment_url: &str,
    ) -> Result<u64, UpstreamError>;

    async fn deployment_status(
        &self,
        repo: &RepoRef,
        deployment_id: u64,
        status: &DeploymentStatus,
    ) -> Result<(), UpstreamError>;
}

#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
    pub app_client: Option<Octocrab>,
    pub api_url: String,
    pub raw_url: String,
    token: String,
    http: reqwest::Client,
    tracker: Arc<RateLimitTracker>,
    commit_dates: Cache<String, String>,
    default_wait: Duration,
}

impl GitHub {
    pub async fn new(config: &GitHubConfig, default_wait: Duration) -> Result<Arc<Self>> {
        let client = Octocrab::builder()
            .base_uri(config.api_url.as_str())
            .context("Invalid GitHub API URL")?
            .personal_token(config.token.clone())
            .build()
            .context("Failed to create GitHub client")?;
        let profile = client.current().user().await.context("Failed to fetch current user")?;
        tracing::info!("Logged in as {}", profile.login);

        let app_client = if let Some(app_config) = &config.app {
            let app_client = Octocrab::builder()
                .base_uri(config.api_url.as_str())
                .context("Invalid GitHub API URL")?
                .app(
                    app_config.id.into(),
                    jsonwebtoken::EncodingKey::from_rsa_pem(app_config.private_key.as_bytes())?,
                )
                .build()
                .context("Failed to create GitHub client")?;
            tracing::info!("Using GitHub app {}", app_config.id);
            Some(app_client)
        } else {
            None
        };
        let mut github = Self::with_client(client, &config.api_url, &config.raw_url, &config.token)?;
        github.app_client = app_client;
        github.default_wait = default_wait;
        Ok(Arc::new(github))
    }

    /// Build a client without contacting the API.
    pub fn with_client(client: Octocrab, api_url: &str, raw_url: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            app_client: None,
            api_url: api_url.trim_end_matches('/').to_string(),
            raw_url: raw_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
            tracker: Arc::new(RateLimitTracker::default()),
            commit_dates: Cache::builder()
                .max_capacity(16384)
                .time_to_live(Duration::from_secs(3600))
                .build(),
            default_wait: rate_limit::DEFAULT_WAIT,
        })
    }

    /// A client acting as the given app installation, or with the personal token
    /// when no installation (or no app) is configured.
    pub async fn session(&self, installation_id: Option<u64>) -> Result<GitHubSession> {
        let mut session = GitHubSession {
            client: self.client.clone(),
            token: self.token.clone(),
            api_url: self.api_url.clone(),
            raw_url: self.raw_url.clone(),
            http: self.http.clone(),
            tracker: self.tracker.clone(),
            commit_dates: self.commit_dates.clone(),
            default_wait: self.default_wait,
        };
        if let (Some(app_client), Some(id)) = (&self.app_client, installation_id) {
            let (client, token) = app_client
                .installation_and_token(InstallationId(id))
                .await
                .with_context(|| format!("Failed to create client for installation {id}"))?;
            session.client = client;
            session.token = token.expose_secret().to_string();
            // Installation budgets are tracked separately from the personal token.
            session.tracker = Arc::new(RateLimitTracker::default());
        }
        Ok(session)
    }
}

/// Authenticated access to the source-control API for one job.
#[derive(Clone)]
pub struct GitHubSession {
    client: Octocrab,
    token: String,
    api_url: String,
    raw_url: String,
    http: reqwest::Client,
    tracker: Arc<RateLimitTracker>,
    commit_dates: Cache<String, String>,
    default_wait: Duration,
}

#[derive(Deserialize)]
struct BranchResponse {
    commit: ShaObject,
}

#[derive(Deserialize)]
struct ShaObject {
    sha: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct CommitListEntry {
    commit: CommitDetails,
}

#[derive(Deserialize)]
struct CommitDetails {
    committer: Option<CommitSignature>,
    author: Option<CommitSignature>,
}

#[derive(Deserialize)]
struct CommitSignature {
    date: Option<String>,
}

#[derive(Deserialize)]
struct DeploymentResponse {
    id: u64,
}

impl GitHubSession {
    fn get(&self, url: &str) -> RequestBuilder {
        self.http
            .get(url)
            .header(AUTHORIZATION, format!("token {}", self.token))
            .header(USER_AGENT, "codebus")
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, UpstreamError> {
        self.tracker.check(now())?;
        let response = request.send().await?;
        let headers = response.headers();
        self.tracker.observe(headers);
        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(response),
            401 => Err(UpstreamError::Unauthorized(url.to_string())),
            429 => Err(UpstreamError::RateLimited {
                wait: wait_from_headers(headers, now(), self.default_wait),
            }),
            403 if is_exhausted(headers) => Err(UpstreamError::RateLimited {
                wait: wait_from_headers(headers, now(), self.default_wait),
            }),
            403 => Err(UpstreamError::Forbidden(url.to_string())),
            404 => Err(UpstreamError::NotFound(url.to_string())),
            status => Err(UpstreamError::Status { status, url: url.to_string() }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, UpstreamError> {
        let response = self.send(self.get(url).header(ACCEPT, "application/vnd.github+json"), url).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|source| UpstreamError::Invalid { url: url.to_string(), source })
    }

    async fn get_raw(&self, request: RequestBuilder, url: &str) -> Result<RawFile, UpstreamError> {
        let response = self.send(request, url).await?;
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok(RawFile { body, last_modified })
    }

    /// API URL below the repository, one segment per `/`-separated part of `path`.
    fn repo_url(&self, repo: &RepoRef, path: &str) -> Result<Url, UpstreamError> {
        build_url(&self.api_url, ["repos", repo.owner.as_str(), repo.repo.as_str(), path])
    }

    pub fn last_rate_limit(&self) -> Option<RateLimitInfo> { self.tracker.last() }
}

/// Append percent-encoded path segments to `base`. Each part is split on `/`.
fn build_url<'a>(
    base: &str,
    parts: impl IntoIterator<Item = &'a str>,
) -> Result<Url, UpstreamError> {
    let invalid = || UpstreamError::Transport(format!("invalid base URL {base}"));
    let mut url = Url::parse(base).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|()| invalid())?
        .pop_if_empty()
        .extend(parts.into_iter().flat_map(|part| part.split('/')));
    Ok(url)
}

/// Treat a 404 as an absent value.
fn optional<T>(result: Result<T, UpstreamError>) -> Result<Option<T>, UpstreamError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(UpstreamError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl CodeSource for GitHubSession {
    async fn tree(&self, repo: &RepoRef, sha: &str) -> Result<Tree, UpstreamError> {
        let mut url = self.repo_url(repo, &format!("git/trees/{sha}"))?;
        url.query_pairs_mut().append_pair("recursive", "1");
        let tree: Tree = self.get_json(url.as_str()).await?;
        if tree.truncated {
            return Err(UpstreamError::Truncated(format!("{repo}@{sha}")));
        }
        Ok(tree)
    }

    async fn raw(
        &self,
        repo: &RepoRef,
        commit: &str,
        path: &str,
    ) -> Result<RawFile, UpstreamError> {
        let url = build_url(&self.raw_url, [repo.owner.as_str(), repo.repo.as_str(), commit, path])?;
        self.get_raw(self.get(url.as_str()), url.as_str()).await
    }

    async fn contents(
        &self,
        repo: &RepoRef,
        git_ref: &str,
        path: &str,
    ) -> Result<RawFile, UpstreamError> {
        let mut url = self.repo_url(repo, &format!("contents/{path}"))?;
        url.query_pairs_mut().append_pair("ref", git_ref);
        let request = self.get(url.as_str()).header(ACCEPT, "application/vnd.github.raw");
        self.get_raw(request, url.as_str()).await
    }

    async fn last_commit_date(
        &self,
        repo: &RepoRef,
        git_ref: &str,
        path: &str,
    ) -> Result<Option<String>, UpstreamError> {
        let key = format!("{repo}/{git_ref}/{path}");
        if let Some(date) = self.commit_dates.get(&key).await {
            return Ok(Some(date));
        }
        let mut url = self.repo_url(repo, "commits")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("sha", git_ref)
            .append_pair("per_page", "1");
        let commits: Vec<CommitListEntry> = self.get_json(url.as_str()).await?;
        let date = commits
            .into_iter()
            .next()
            .and_then(|c| c.commit.committer.or(c.commit.author))
            .and_then(|s| s.date)
            .and_then(|date| rfc3339_to_http_date(&date));
        if let Some(date) = &date {
            self.commit_dates.insert(key, date.clone()).await;
        }
        Ok(date)
    }

    async fn branch_head(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> Result<Option<String>, UpstreamError> {
        let url = self.repo_url(repo, &format!("branches/{branch}"))?;
        Ok(optional(self.get_json::<BranchResponse>(url.as_str()).await)?.map(|b| b.commit.sha))
    }

    async fn tag_commit(&self, repo: &RepoRef, tag: &str) -> Result<Option<String>, UpstreamError> {
        let url = self.repo_url(repo, &format!("git/ref/tags/{tag}"))?;
        let Some(mut object) =
            optional(self.get_json::<RefResponse>(url.as_str()).await)?.map(|r| r.object)
        else {
            return Ok(None);
        };
        while object.kind == "tag" {
            let url = self.repo_url(repo, &format!("git/tags/{}", object.sha))?;
            object = self.get_json::<RefResponse>(url.as_str()).await?.object;
        }
        Ok(Some(object.sha))
    }

    async fn rate_limit(&self) -> Result<RateLimitInfo, UpstreamError> {
        let limit = self.client.ratelimit().get().await?;
        let info = RateLimitInfo {
            limit: limit.rate.limit as u64,
            remaining: limit.rate.remaining as u64,
            reset: limit.rate.reset as i64,
        };
        self.tracker.set(info);
        Ok(info)
    }

    async fn create_deployment(
        &self,
        repo: &RepoRef,
        git_ref: &str,
        environment_url: &str,
    ) -> Result<u64, UpstreamError> {
        let route = format!("/repos/{}/{}/deployments", repo.owner, repo.repo);
        let body = serde_json::json!({
            "ref": git_ref,
            "environment": environment_url,
            "auto_merge": false,
            "required_contexts": [],
            "transient_environment": true,
        });
        let deployment: DeploymentResponse = self.client.post(route, Some(&body)).await?;
        Ok(deployment.id)
    }

    async fn deployment_status(
        &self,
        repo: &RepoRef,
        deployment_id: u64,
        status: &DeploymentStatus,
    ) -> Result<(), UpstreamError> {
        let route =
            format!("/repos/{}/{}/deployments/{deployment_id}/statuses", repo.owner, repo.repo);
        let _: serde_json::Value = self.client.post(route, Some(status)).await?;
        Ok(())
    }
}
