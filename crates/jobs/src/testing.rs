use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use codebus_core::{config::SyncConfig, models::RateLimitInfo};
use codebus_github::{
    CodeSource, DeploymentState, DeploymentStatus, RawFile, RepoRef, Tree, TreeEntry, UpstreamError,
};
use codebus_storage::{Bus, jobs::JobStore};

use crate::{
    JobContext,
    effects::{Downstream, SideEffect},
    fstab::Fstab,
};

/// In-memory repository at a single commit.
#[derive(Default)]
pub struct FakeSource {
    sha: String,
    files: BTreeMap<String, Bytes>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    truncated: bool,
    failures: HashMap<String, u16>,
    rate_limited: HashMap<String, usize>,
    budget: Option<usize>,
    fetches: Vec<String>,
    lookups: usize,
    statuses: Vec<DeploymentState>,
    create_failure: Option<u16>,
    status_failure: Option<u16>,
}

impl FakeSource {
    pub const LAST_MODIFIED: &'static str = "Tue, 01 Jun 2021 10:00:00 GMT";
    const WAIT: Duration = Duration::from_millis(1);

    pub fn new(sha: &str, files: &[(&str, &str)]) -> Arc<Self> {
        let files = files
            .iter()
            .map(|(path, body)| (path.to_string(), Bytes::from(body.to_string())))
            .collect();
        Arc::new(Self { sha: sha.to_string(), files, ..Default::default() })
    }

    pub fn set_truncated(&self, truncated: bool) { self.state.lock().unwrap().truncated = truncated; }

    /// Fail fetches of `path` with the given status.
    pub fn fail_path(&self, path: &str, status: u16) {
        self.state.lock().unwrap().failures.insert(path.to_string(), status);
    }

    /// Rate limit the next `times` fetches of `path`.
    pub fn rate_limit_path(&self, path: &str, times: usize) {
        self.state.lock().unwrap().rate_limited.insert(path.to_string(), times);
    }

    /// Number of successful fetches allowed before every fetch is rate limited.
    pub fn set_budget(&self, budget: Option<usize>) { self.state.lock().unwrap().budget = budget; }

    /// Fail deployment creation and/or status reports with the given statuses.
    pub fn fail_deployments(&self, create: Option<u16>, status: Option<u16>) {
        let mut state = self.state.lock().unwrap();
        state.create_failure = create;
        state.status_failure = status;
    }

    pub fn fetches(&self) -> Vec<String> { self.state.lock().unwrap().fetches.clone() }

    pub fn lookups(&self) -> usize { self.state.lock().unwrap().lookups }

    pub fn statuses(&self) -> Vec<DeploymentState> { self.state.lock().unwrap().statuses.clone() }

    fn fetch(&self, path: &str) -> Result<RawFile, UpstreamError> {
        let mut state = self.state.lock().unwrap();
        if let Some(times) = state.rate_limited.get_mut(path)
            && *times > 0
        {
            *times -= 1;
            return Err(UpstreamError::RateLimited { wait: Self::WAIT });
        }
        if let Some(&status) = state.failures.get(path) {
            return Err(error_for(status, path));
        }
        let Some(body) = self.files.get(path) else {
            return Err(UpstreamError::NotFound(path.to_string()));
        };
        if let Some(budget) = &mut state.budget {
            if *budget == 0 {
                return Err(UpstreamError::RateLimited { wait: Self::WAIT });
            }
            *budget -= 1;
        }
        state.fetches.push(path.to_string());
        Ok(RawFile { body: body.clone(), last_modified: None })
    }
}

fn error_for(status: u16, what: &str) -> UpstreamError {
    match status {
        401 => UpstreamError::Unauthorized(what.to_string()),
        403 => UpstreamError::Forbidden(what.to_string()),
        404 => UpstreamError::NotFound(what.to_string()),
        status => UpstreamError::Status { status, url: what.to_string() },
    }
}

#[async_trait]
impl CodeSource for FakeSource {
    async fn tree(&self, _repo: &RepoRef, sha: &str) -> Result<Tree, UpstreamError> {
        let entries = self
            .files
            .keys()
            .map(|path| TreeEntry {
                path: path.clone(),
                kind: "blob".to_string(),
                sha: format!("{sha}:{path}"),
                size: None,
            })
            .collect();
        let truncated = self.state.lock().unwrap().truncated;
        Ok(Tree { sha: sha.to_string(), truncated, entries })
    }

    async fn raw(&self, _repo: &RepoRef, _commit: &str, path: &str) -> Result<RawFile, UpstreamError> {
        self.fetch(path)
    }

    async fn contents(
        &self,
        _repo: &RepoRef,
        _git_ref: &str,
        path: &str,
    ) -> Result<RawFile, UpstreamError> {
        self.fetch(path)
    }

    async fn last_commit_date(
        &self,
        _repo: &RepoRef,
        _git_ref: &str,
        _path: &str,
    ) -> Result<Option<String>, UpstreamError> {
        self.state.lock().unwrap().lookups += 1;
        Ok(Some(Self::LAST_MODIFIED.to_string()))
    }

    async fn branch_head(&self, _repo: &RepoRef, _branch: &str) -> Result<Option<String>, UpstreamError> {
        Ok(Some(self.sha.clone()))
    }

    async fn tag_commit(&self, _repo: &RepoRef, _tag: &str) -> Result<Option<String>, UpstreamError> {
        Ok(Some(self.sha.clone()))
    }

    async fn rate_limit(&self) -> Result<RateLimitInfo, UpstreamError> {
        Ok(RateLimitInfo { limit: 5000, remaining: 4999, reset: 0 })
    }

    async fn create_deployment(
        &self,
        _repo: &RepoRef,
        _git_ref: &str,
        _environment_url: &str,
    ) -> Result<u64, UpstreamError> {
        match self.state.lock().unwrap().create_failure {
            Some(status) => Err(error_for(status, "deployments")),
            None => Ok(1),
        }
    }

    async fn deployment_status(
        &self,
        _repo: &RepoRef,
        _deployment_id: u64,
        status: &DeploymentStatus,
    ) -> Result<(), UpstreamError> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.status_failure {
            return Err(error_for(failure, "statuses"));
        }
        state.statuses.push(status.state);
        Ok(())
    }
}

/// Downstream that records the side effects it is asked to perform.
#[derive(Default)]
pub struct RecordingDownstream {
    pub effects: Mutex<Vec<SideEffect>>,
}

impl RecordingDownstream {
    pub fn effects(&self) -> Vec<SideEffect> { self.effects.lock().unwrap().clone() }

    fn record(&self, effect: SideEffect) -> Result<()> {
        self.effects.lock().unwrap().push(effect);
        Ok(())
    }
}

#[async_trait]
impl Downstream for RecordingDownstream {
    async fn purge(
        &self,
        owner: &str,
        repo: &str,
        ref_name: &str,
        paths: &[String],
        keys: &[String],
    ) -> Result<()> {
        self.record(SideEffect::Purge {
            owner: owner.to_string(),
            repo: repo.to_string(),
            ref_name: ref_name.to_string(),
            paths: paths.to_vec(),
            keys: keys.to_vec(),
        })
    }

    async fn deploy_mount_table(&self, owner: &str, repo: &str, fstab: &Fstab) -> Result<()> {
        self.record(SideEffect::DeployMountTable {
            owner: owner.to_string(),
            repo: repo.to_string(),
            fstab: fstab.clone(),
        })
    }

    async fn merge_content_config(&self, owner: &str, repo: &str) -> Result<()> {
        self.record(SideEffect::MergeContentConfig { owner: owner.to_string(), repo: repo.to_string() })
    }

    async fn reindex(&self, owner: &str, repo: &str) -> Result<()> {
        self.record(SideEffect::Reindex { owner: owner.to_string(), repo: repo.to_string() })
    }
}

pub fn context(source: Arc<FakeSource>) -> (JobContext, Arc<RecordingDownstream>) {
    context_with(source, |_| {})
}

pub fn context_with(
    source: Arc<FakeSource>,
    configure: impl FnOnce(&mut SyncConfig),
) -> (JobContext, Arc<RecordingDownstream>) {
    let mut config = SyncConfig::default();
    configure(&mut config);
    let downstream = Arc::new(RecordingDownstream::default());
    let ctx = JobContext {
        config: Arc::new(config),
        source,
        code_bus: Bus::memory(),
        content_bus: Bus::memory(),
        jobs: Some(JobStore::new(Bus::memory())),
        downstream: downstream.clone(),
    };
    (ctx, downstream)
}
