use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::util::sanitize_ref;

/// Phases of a code job. Transitions are strictly sequential.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Collect,
    Sync,
    PostProcess,
    FlushCache,
    Completed,
}

impl Phase {
    pub fn next(self) -> Self {
        match self {
            Self::Collect => Self::Sync,
            Self::Sync => Self::PostProcess,
            Self::PostProcess => Self::FlushCache,
            Self::FlushCache | Self::Completed => Self::Completed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Sync => "sync",
            Self::PostProcess => "postProcess",
            Self::FlushCache => "flushCache",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Ignored,
}

/// One line of a tree diff.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Repository-relative path, without a leading slash.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Change {
    pub fn new(path: &str, kind: ChangeType, commit: Option<&str>) -> Self {
        Self {
            path: path.trim_start_matches('/').to_string(),
            kind,
            commit: commit.map(str::to_string),
            content_type: None,
        }
    }

    pub fn added(path: &str, commit: &str) -> Self { Self::new(path, ChangeType::Added, Some(commit)) }

    pub fn modified(path: &str, commit: &str) -> Self {
        Self::new(path, ChangeType::Modified, Some(commit))
    }

    pub fn deleted(path: &str) -> Self { Self::new(path, ChangeType::Deleted, None) }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn is_ignored(&self) -> bool { self.kind == ChangeType::Ignored }

    pub fn is_deleted(&self) -> bool { self.kind == ChangeType::Deleted }

    /// Path as exposed to consumers, always with a leading slash.
    pub fn resource_path(&self) -> String { format!("/{}", self.path) }
}

/// Outcome of synchronizing a single file.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub resource_path: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Set when the stored copy was already current and no write happened.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Resource {
    pub fn written(resource_path: String, content_length: u64, content_type: &str) -> Self {
        Self {
            resource_path,
            status: 200,
            content_length: Some(content_length),
            content_type: Some(content_type.to_string()),
            deleted: false,
            skipped: false,
            error: None,
        }
    }

    pub fn deleted(resource_path: String) -> Self {
        Self {
            resource_path,
            status: 200,
            content_length: None,
            content_type: None,
            deleted: true,
            skipped: false,
            error: None,
        }
    }

    pub fn skipped(resource_path: String, content_length: Option<u64>) -> Self {
        Self {
            resource_path,
            status: 304,
            content_length,
            content_type: None,
            deleted: false,
            skipped: true,
            error: None,
        }
    }

    pub fn failed(resource_path: String, status: u16, error: impl Into<String>) -> Self {
        Self {
            resource_path,
            status,
            content_length: None,
            content_type: None,
            deleted: false,
            skipped: false,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool { self.error.is_some() }

    /// Whether this resource changed in storage and therefore needs purging.
    pub fn is_changed(&self) -> bool { self.status == 200 && !self.skipped }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub ignored: usize,
}

/// Snapshot of the source-control API budget.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds at which the budget resets.
    pub reset: i64,
}

impl RateLimitInfo {
    pub fn is_exhausted(&self, now: i64) -> bool { self.remaining == 0 && self.reset > now }

    pub fn wait(&self, now: i64) -> Duration {
        Duration::from_secs(u64::try_from(self.reset - now).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    #[default]
    Push,
    BranchCreated,
    BranchDeleted,
    TagCreated,
    Manual,
}

/// The event payload a job was created from.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobData {
    pub kind: EventKind,
    /// Project (org) owning the published site.
    pub owner: String,
    /// Project (site) name.
    pub repo: String,
    /// Sanitized ref used for storage prefixes and cache keys.
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub code_owner: String,
    pub code_repo: String,
    /// Upstream branch or tag name.
    pub code_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<u64>,
    /// Whether the caller may report deployment status.
    pub report_deployment: bool,
    /// Treat the event as a whole-branch update instead of an incremental one.
    pub whole_branch: bool,
    /// Changes pre-computed by the upstream push notification.
    pub changes: Vec<Change>,
    /// Project-configured headers stored verbatim with every resource.
    pub headers: BTreeMap<String, String>,
    /// Remove the entire branch prefix instead of syncing files.
    pub delete_tree: bool,
}

impl JobData {
    /// Event for a project whose code lives in a repository of the same name.
    pub fn new(kind: EventKind, owner: &str, repo: &str, code_ref: &str) -> Self {
        Self {
            kind,
            owner: owner.to_string(),
            repo: repo.to_string(),
            ref_name: sanitize_ref(code_ref),
            code_owner: owner.to_string(),
            code_repo: repo.to_string(),
            code_ref: code_ref.to_string(),
            ..Default::default()
        }
    }

    /// Fill derived fields that callers may leave empty.
    pub fn normalize(&mut self) {
        if self.code_owner.is_empty() {
            self.code_owner = self.owner.clone();
        }
        if self.code_repo.is_empty() {
            self.code_repo = self.repo.clone();
        }
        if self.code_ref.is_empty() {
            self.code_ref = self.ref_name.clone();
        }
        self.ref_name = sanitize_ref(if self.ref_name.is_empty() {
            &self.code_ref
        } else {
            &self.ref_name
        });
        for change in &mut self.changes {
            change.path = change.path.trim_start_matches('/').to_string();
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.owner.is_empty()
            && !self.repo.is_empty()
            && !self.code_owner.is_empty()
            && !self.code_repo.is_empty()
            && !self.ref_name.is_empty()
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobState {
    pub phase: Phase,
    pub data: JobData,
    pub changes: Vec<Change>,
    pub resources: Vec<Resource>,
    pub progress: Progress,
    pub cancelled: bool,
    /// Milliseconds spent waiting for rate limits so far.
    pub waiting: u64,
    pub invocations: u32,
}

impl JobState {
    pub fn new(data: JobData) -> Self { Self { data, ..Default::default() } }

    pub fn update_progress_after_collect(&mut self) {
        let changes = self.changes.iter().filter(|c| !c.is_ignored()).count();
        self.progress = Progress { total: changes + self.resources.len(), ..Default::default() };
    }

    pub fn update_progress_after_sync(&mut self) {
        self.progress.processed = self.resources.len();
        self.progress.failed = self.resources.iter().filter(|r| r.is_failed()).count();
        self.progress.ignored = self.resources.iter().filter(|r| r.skipped).count();
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub topic: String,
    pub id: String,
    /// Transient jobs keep their progress in memory only.
    #[serde(default)]
    pub transient: bool,
    pub state: JobState,
}

impl Job {
    pub const CODE_TOPIC: &'static str = "code";

    pub fn new(id: String, data: JobData) -> Self {
        Self { topic: Self::CODE_TOPIC.to_string(), id, transient: false, state: JobState::new(data) }
    }

    pub fn data(&self) -> &JobData { &self.state.data }

    pub fn is_completed(&self) -> bool { self.state.phase == Phase::Completed }
}
