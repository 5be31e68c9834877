use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use codebus_core::{
    content_type,
    models::{Change, JobData, JobState, Resource},
};
use codebus_github::{RawFile, UpstreamError};
use codebus_storage::Metadata;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{JobContext, branch_prefix, code_repo, error::JobError, tree::CHECKPOINT_FILE};

pub const COMMIT_ID: &str = "x-commit-id";
pub const SOURCE_LAST_MODIFIED: &str = "x-source-last-modified";

/// Outcome of synchronizing one change.
struct Synced {
    resource: Resource,
    /// Source last-modified of a written resource.
    last_modified: Option<String>,
}

/// Mirror every pending change into the code bus.
///
/// Changes that already have a resource from a previous invocation are not
/// processed again. Per-file failures are recorded on their resource; a rate limit
/// or authorization failure stops the batch and is returned after the resources
/// finished so far have been added to the state.
pub async fn sync(state: &mut JobState, ctx: &JobContext) -> Result<(), JobError> {
    let data = Arc::new(state.data.clone());
    if data.delete_tree {
        let prefix = branch_prefix(&data);
        let removed = ctx.code_bus.rmdir(&prefix, ctx.config.storage_concurrency).await?;
        tracing::info!("Removed {removed} objects below {prefix}");
        return Ok(());
    }

    let done = state.resources.iter().map(|r| r.resource_path.clone()).collect::<HashSet<_>>();
    let pending = state
        .changes
        .iter()
        .filter(|c| !c.is_ignored() && !done.contains(&c.resource_path()))
        .cloned()
        .collect::<Vec<_>>();
    tracing::info!(
        "Syncing {} changes ({} already processed)",
        pending.len(),
        state.changes.len() - pending.len()
    );

    let sem = Arc::new(Semaphore::new(ctx.config.upstream_concurrency.max(1)));
    let halt = Arc::new(AtomicBool::new(false));
    let mut set = JoinSet::new();
    for change in pending {
        let sem = sem.clone();
        let halt = halt.clone();
        let ctx = ctx.clone();
        let data = data.clone();
        set.spawn(async move {
            let _permit = sem.acquire().await.ok();
            if halt.load(Ordering::SeqCst) {
                return None;
            }
            let result = sync_change(&ctx, &data, &change).await;
            if result.is_err() {
                halt.store(true, Ordering::SeqCst);
            }
            Some(result)
        });
    }

    let mut error = None;
    let mut last_modified = None;
    while let Some(join_result) = set.join_next().await {
        match join_result {
            Ok(Some(Ok(synced))) => {
                if synced.last_modified.is_some() {
                    last_modified = synced.last_modified;
                }
                state.resources.push(synced.resource);
            }
            Ok(Some(Err(e))) => {
                tracing::warn!("Sync halted: {e}");
                // A fatal error wins over a rate limit.
                if error.as_ref().is_none_or(JobError::is_rate_limited) {
                    error = Some(e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Sync task failed: {:?}", e),
        }
    }
    state.resources.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
    if let Some(e) = error {
        return Err(e);
    }
    write_checkpoint(&data, ctx, last_modified).await
}

async fn sync_change(ctx: &JobContext, data: &JobData, change: &Change) -> Result<Synced, JobError> {
    let key = format!("{}{}", branch_prefix(data), change.path);
    let resource_path = change.resource_path();
    if change.is_deleted() {
        let resource = match ctx.code_bus.remove(&key).await {
            Ok(()) => Resource::deleted(resource_path),
            Err(e) => Resource::failed(resource_path, 500, format!("{e:#}")),
        };
        return Ok(Synced { resource, last_modified: None });
    }

    let repo = code_repo(data);
    let commit = change.commit.as_deref().or(data.sha.as_deref());
    let fetched = match commit {
        Some(commit) if !data.whole_branch => ctx.source.raw(&repo, commit, &change.path).await,
        _ => {
            let git_ref = commit.unwrap_or(&data.code_ref);
            ctx.source.contents(&repo, git_ref, &change.path).await
        }
    };
    let RawFile { body, last_modified } = match fetched {
        Ok(file) => file,
        Err(e @ (UpstreamError::Unauthorized(_) | UpstreamError::RateLimited { .. })) => {
            return Err(JobError::upstream(e, format!("unable to fetch {repo}/{}", change.path)));
        }
        Err(e) => {
            tracing::debug!("Failed to fetch {}: {}", change.path, e);
            let resource = Resource::failed(resource_path, e.status(), e.to_string());
            return Ok(Synced { resource, last_modified: None });
        }
    };

    let existing = match ctx.code_bus.head(&key).await {
        Ok(info) => info,
        Err(e) => {
            tracing::warn!("Failed to stat {key}: {e:#}");
            None
        }
    };
    let stored = existing.as_ref().map(|info| &info.metadata);
    let last_modified = match last_modified {
        Some(value) => Some(value),
        // Reuse the date recorded for the same commit instead of looking it up again.
        None => {
            let same_commit = stored
                .filter(|m| commit.is_some() && m.get(COMMIT_ID).map(String::as_str) == commit);
            match same_commit.and_then(|m| m.get(SOURCE_LAST_MODIFIED)) {
                Some(value) => Some(value.clone()),
                None => lookup_last_modified(ctx, data, change, commit).await?,
            }
        }
    };
    if let (Some(value), Some(metadata)) = (&last_modified, stored)
        && metadata.get(SOURCE_LAST_MODIFIED) == Some(value)
    {
        let length = existing.as_ref().map(|info| info.content_length);
        return Ok(Synced { resource: Resource::skipped(resource_path, length), last_modified: None });
    }

    let content_type = change
        .content_type
        .clone()
        .unwrap_or_else(|| content_type::from_path(&change.path).to_string());
    let mut metadata: Metadata = data.headers.clone();
    if let Some(commit) = commit {
        metadata.insert(COMMIT_ID.to_string(), commit.to_string());
    }
    if let Some(value) = &last_modified {
        metadata.insert(SOURCE_LAST_MODIFIED.to_string(), value.clone());
    }
    let length = body.len() as u64;
    let compress = content_type::is_compressible(&content_type);
    let resource = match ctx.code_bus.put(&key, body, &content_type, &metadata, compress).await {
        Ok(()) => Resource::written(resource_path, length, &content_type),
        Err(e) => {
            tracing::warn!("Failed to store {key}: {e:#}");
            return Ok(Synced {
                resource: Resource::failed(resource_path, 500, format!("{e:#}")),
                last_modified: None,
            });
        }
    };
    Ok(Synced { resource, last_modified })
}

async fn lookup_last_modified(
    ctx: &JobContext,
    data: &JobData,
    change: &Change,
    commit: Option<&str>,
) -> Result<Option<String>, JobError> {
    let repo = code_repo(data);
    let git_ref = commit.unwrap_or(&data.code_ref);
    match ctx.source.last_commit_date(&repo, git_ref, &change.path).await {
        Ok(date) => Ok(date),
        Err(e @ UpstreamError::RateLimited { .. }) => Err(e.into()),
        Err(e) => {
            tracing::warn!("Failed to look up last commit of {}: {}", change.path, e);
            Ok(None)
        }
    }
}

/// Record the synchronized commit for the next incremental diff.
async fn write_checkpoint(
    data: &JobData,
    ctx: &JobContext,
    last_modified: Option<String>,
) -> Result<(), JobError> {
    let Some(sha) = &data.sha else {
        return Ok(());
    };
    let key = format!("{}{}", branch_prefix(data), CHECKPOINT_FILE);
    if last_modified.is_none()
        && let Some(info) = ctx.code_bus.head(&key).await?
        && info.metadata.get(COMMIT_ID) == Some(sha)
    {
        return Ok(());
    }
    let mut metadata = Metadata::new();
    metadata.insert(COMMIT_ID.to_string(), sha.clone());
    if let Some(value) = last_modified {
        metadata.insert(SOURCE_LAST_MODIFIED.to_string(), value);
    }
    ctx.code_bus.put(&key, Bytes::from(sha.clone()), "text/plain", &metadata, false).await?;
    tracing::debug!("Wrote checkpoint {sha}");
    Ok(())
}
