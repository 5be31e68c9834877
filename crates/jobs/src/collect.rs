use std::path::Path;

use codebus_core::{
    content_type,
    models::{Change, ChangeType, EventKind, JobData, JobState, Resource},
    util::{code_prefix, sanitize_ref},
};
use codebus_github::{RepoRef, UpstreamError};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::{
    JobContext, branch_prefix, code_repo,
    error::JobError,
    retry::with_retry,
    tree::{diff_tree, is_internal},
};

pub const IGNORE_FILE: &str = ".hlxignore";

/// How the change set of a job is computed. Selected once from the event.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CollectStrategy {
    /// Use the changes carried by the push event.
    Incremental,
    /// Diff the full upstream tree against the stored objects.
    FullTreeWalk,
    /// Seed the branch from a sibling branch, then walk the tree.
    CopySibling { sibling: String },
    /// Remove the whole branch.
    DeleteAll,
}

impl CollectStrategy {
    pub fn select(data: &JobData, default_branch: &str) -> Result<Self, JobError> {
        if !data.is_valid() {
            return Err(JobError::fatal(format!(
                "malformed event: owner={:?} repo={:?} ref={:?}",
                data.owner, data.repo, data.ref_name
            )));
        }
        let default_ref = sanitize_ref(default_branch);
        let is_default = data.ref_name == default_ref;
        Ok(match data.kind {
            EventKind::BranchDeleted if is_default => {
                return Err(JobError::fatal(format!(
                    "cowardly refusing to delete default branch {default_branch}"
                )));
            }
            EventKind::BranchDeleted => Self::DeleteAll,
            EventKind::TagCreated => Self::FullTreeWalk,
            EventKind::BranchCreated if is_default => Self::FullTreeWalk,
            EventKind::BranchCreated => Self::CopySibling { sibling: default_ref },
            EventKind::Push | EventKind::Manual if data.whole_branch => Self::FullTreeWalk,
            EventKind::Push if data.base_ref.is_some() => Self::Incremental,
            EventKind::Manual if !data.changes.is_empty() => Self::Incremental,
            EventKind::Push | EventKind::Manual => Self::FullTreeWalk,
        })
    }
}

/// Compute `state.changes` (and, for branch removal, `state.resources`).
pub async fn collect(state: &mut JobState, ctx: &JobContext) -> Result<(), JobError> {
    let strategy = CollectStrategy::select(&state.data, &ctx.config.default_branch)?;
    tracing::info!(?strategy, "Collecting changes");
    let ignore = match strategy {
        CollectStrategy::DeleteAll => None,
        _ => load_ignore(ctx, &state.data).await?,
    };
    state.changes = match strategy {
        CollectStrategy::DeleteAll => {
            state.resources = vec![Resource::deleted("/*".to_string())];
            state.data.delete_tree = true;
            vec![Change::deleted("*")]
        }
        CollectStrategy::Incremental => state.data.changes.clone(),
        CollectStrategy::FullTreeWalk => walk_tree(&mut state.data, ctx).await?,
        CollectStrategy::CopySibling { sibling } => {
            copy_sibling(&state.data, &sibling, ignore.as_ref(), ctx).await?;
            walk_tree(&mut state.data, ctx).await?
        }
    };
    for change in &mut state.changes {
        if change.is_deleted() {
            continue;
        }
        if ignore.as_ref().is_some_and(|gi| is_ignored(gi, &change.path)) {
            change.kind = ChangeType::Ignored;
        }
        if change.content_type.is_none() {
            change.content_type = Some(content_type::from_path(&change.path).to_string());
        }
    }
    Ok(())
}

async fn resolve_commit(data: &JobData, ctx: &JobContext) -> Result<String, JobError> {
    if let Some(sha) = &data.sha {
        return Ok(sha.clone());
    }
    let repo = code_repo(data);
    let result = if data.kind == EventKind::TagCreated {
        ctx.source.tag_commit(&repo, &data.code_ref).await
    } else {
        ctx.source.branch_head(&repo, &data.code_ref).await
    };
    result
        .map_err(|e| JobError::upstream(e, format!("unable to resolve {repo}/{}", data.code_ref)))?
        .ok_or_else(|| JobError::fatal(format!("unable to resolve {repo}/{}", data.code_ref)))
}

/// Full resynchronization: diff the upstream tree against the stored branch.
async fn walk_tree(data: &mut JobData, ctx: &JobContext) -> Result<Vec<Change>, JobError> {
    let sha = resolve_commit(data, ctx).await?;
    let repo = code_repo(data);
    let tree = ctx.source.tree(&repo, &sha).await.map_err(|e| match e {
        UpstreamError::Truncated(what) => JobError::fatal(format!("tree of {what} is truncated")),
        e => JobError::upstream(e, format!("unable to fetch tree of {repo}/{}", data.code_ref)),
    })?;
    let stored = ctx.code_bus.list(&branch_prefix(data)).await?;
    let changes = diff_tree(&tree, stored.iter().map(|e| e.path.as_str()), &sha)?;
    tracing::info!("Collected {} changes from tree {}", changes.len(), sha);
    data.sha = Some(sha);
    Ok(changes)
}

async fn copy_sibling(
    data: &JobData,
    sibling: &str,
    ignore: Option<&Gitignore>,
    ctx: &JobContext,
) -> Result<(), JobError> {
    let src = code_prefix(&data.code_owner, &data.code_repo, sibling);
    let dst = branch_prefix(data);
    let copied = ctx
        .code_bus
        .copy_deep(
            &src,
            &dst,
            |path| !is_internal(path) && !ignore.is_some_and(|gi| is_ignored(gi, path)),
            ctx.config.storage_concurrency,
        )
        .await?;
    if copied == 0 {
        tracing::info!("No sibling branch {sibling} to copy from");
    } else {
        tracing::info!("Copied {copied} objects from sibling branch {sibling}");
    }
    Ok(())
}

/// Fetch and parse the ignore file. A missing or forbidden file means nothing is ignored.
async fn load_ignore(ctx: &JobContext, data: &JobData) -> Result<Option<Gitignore>, JobError> {
    let repo: RepoRef = code_repo(data);
    let git_ref = data.sha.as_deref().unwrap_or(&data.code_ref);
    let result = with_retry(ctx.config.max_retry_wait(), || {
        ctx.source.raw(&repo, git_ref, IGNORE_FILE)
    })
    .await;
    let file = match result {
        Ok(file) => file,
        Err(UpstreamError::NotFound(_) | UpstreamError::Forbidden(_)) => return Ok(None),
        Err(e) => {
            return Err(JobError::upstream(e, format!("unable to fetch {IGNORE_FILE} of {repo}")));
        }
    };
    let text = String::from_utf8_lossy(&file.body);
    let mut builder = GitignoreBuilder::new("");
    for line in text.lines() {
        if let Err(e) = builder.add_line(None, line) {
            tracing::warn!("Ignoring invalid {IGNORE_FILE} pattern {line:?}: {e}");
        }
    }
    match builder.build() {
        Ok(gi) => Ok(Some(gi)),
        Err(e) => {
            tracing::warn!("Failed to build {IGNORE_FILE} matcher: {e}");
            Ok(None)
        }
    }
}

fn is_ignored(gi: &Gitignore, path: &str) -> bool {
    gi.matched_path_or_any_parents(Path::new(path.trim_start_matches('/')), false).is_ignore()
}
