use std::time::Instant;

use codebus_core::{
    config::SyncConfig,
    models::{Job, JobData, Phase, RateLimitInfo},
};
use codebus_github::{DeploymentState, DeploymentStatus};

use crate::{
    JobContext, code_repo,
    collect::collect,
    effects::{execute, flush_cache},
    error::JobError,
    postprocess::post_process,
    sync::sync,
};

/// Run a job from its current phase until it completes, fails, or is cancelled.
///
/// Phases advance only on success and the state is saved after each one, so a
/// re-invocation continues where the previous one stopped. A job found in
/// `collect` on re-invocation without having waited for a rate limit was
/// interrupted mid-collect and is refused.
pub async fn run(job: &mut Job, ctx: &JobContext) -> Result<(), JobError> {
    check_resume(job)?;
    job.state.invocations += 1;
    start_deployment(job, ctx).await;

    let result = run_phases(job, ctx).await;
    if let Err(e) = &result {
        tracing::warn!(phase = %job.state.phase, "Job stopped: {e:#}");
        if let Err(save_err) = save(job, ctx).await {
            tracing::error!("Failed to save job state: {save_err:#}");
        }
    }
    finish_deployment(job, ctx, &result).await;
    result
}

/// Persist the job state, unless the job is transient or there is no job store.
pub async fn save(job: &Job, ctx: &JobContext) -> Result<(), JobError> {
    if let Some(store) = &ctx.jobs {
        store.save(job).await?;
    }
    Ok(())
}

/// Refuse to re-invoke a job that was interrupted while collecting changes.
pub fn check_resume(job: &Job) -> Result<(), JobError> {
    let state = &job.state;
    if state.invocations > 0 && state.phase == Phase::Collect && state.waiting == 0 {
        return Err(JobError::fatal(format!(
            "job {} was interrupted while collecting changes, please resubmit with a smaller input set",
            job.id
        )));
    }
    Ok(())
}

async fn is_cancelled(job: &Job, ctx: &JobContext) -> Result<bool, JobError> {
    if job.state.cancelled {
        return Ok(true);
    }
    match &ctx.jobs {
        Some(store) => Ok(store.is_cancelled(job).await?),
        None => Ok(false),
    }
}

async fn run_phases(job: &mut Job, ctx: &JobContext) -> Result<(), JobError> {
    while !job.is_completed() {
        // Latch the flag before the next save overwrites the stored copy.
        if is_cancelled(job, ctx).await? {
            job.state.cancelled = true;
        }
        let phase = job.state.phase;
        if phase == Phase::Sync && job.state.cancelled {
            tracing::info!("Job cancelled, keeping {} collected changes", job.state.changes.len());
            save(job, ctx).await?;
            return Ok(());
        }

        let start = Instant::now();
        match phase {
            Phase::Collect => {
                collect(&mut job.state, ctx).await?;
                job.state.update_progress_after_collect();
            }
            Phase::Sync => {
                sync(&mut job.state, ctx).await?;
                job.state.update_progress_after_sync();
            }
            Phase::PostProcess => {
                let effects = post_process(&job.state, ctx).await;
                execute(ctx.downstream.as_ref(), &effects).await;
            }
            Phase::FlushCache => {
                let effects = flush_cache(&job.state, &ctx.config);
                execute(ctx.downstream.as_ref(), &effects).await;
            }
            Phase::Completed => break,
        }
        job.state.phase = phase.next();
        tracing::info!(
            progress = ?job.state.progress,
            "Finished {phase} in {}ms",
            start.elapsed().as_millis()
        );
        save(job, ctx).await?;
    }
    Ok(())
}

fn environment_url(data: &JobData, config: &SyncConfig) -> String {
    format!("https://{}--{}--{}.{}", data.ref_name, data.repo, data.owner, config.preview_domain)
}

async fn start_deployment(job: &mut Job, ctx: &JobContext) {
    let data = &mut job.state.data;
    if !data.report_deployment {
        return;
    }
    if data.deployment_id.is_none() && job.state.invocations == 1 {
        let url = environment_url(data, &ctx.config);
        let repo = code_repo(data);
        match ctx.source.create_deployment(&repo, &data.code_ref, &url).await {
            Ok(id) => data.deployment_id = Some(id),
            Err(e) => tracing::warn!("Failed to create deployment: {e}"),
        }
    }
    report_deployment(job, ctx, DeploymentState::InProgress, "Synchronizing code".to_string()).await;
}

async fn finish_deployment(job: &Job, ctx: &JobContext, result: &Result<(), JobError>) {
    if !job.state.data.report_deployment {
        return;
    }
    let (state, description) = match result {
        Ok(()) if job.is_completed() => {
            let progress = &job.state.progress;
            let description =
                format!("Synchronized {} resources ({} failed)", progress.processed, progress.failed);
            (DeploymentState::Success, description)
        }
        Ok(()) => (DeploymentState::Failure, "Job cancelled".to_string()),
        // The job is still in progress and will be resumed.
        Err(JobError::RateLimited { .. }) => return,
        Err(e) => {
            let mut description = format!("{e}");
            if let Ok(info) = ctx.source.rate_limit().await {
                description.push_str(&format!(" ({})", describe_rate_limit(&info)));
            }
            (DeploymentState::Failure, description)
        }
    };
    report_deployment(job, ctx, state, description).await;
}

fn describe_rate_limit(info: &RateLimitInfo) -> String {
    format!("rate limit: {}/{} remaining, reset at {}", info.remaining, info.limit, info.reset)
}

async fn report_deployment(job: &Job, ctx: &JobContext, state: DeploymentState, description: String) {
    let data = &job.state.data;
    let Some(deployment_id) = data.deployment_id else {
        return;
    };
    let status = DeploymentStatus {
        state,
        environment_url: environment_url(data, &ctx.config),
        description,
    };
    match ctx.source.deployment_status(&code_repo(data), deployment_id, &status).await {
        Ok(()) => tracing::debug!(deployment_id, ?state, "Reported deployment status"),
        Err(e) if e.is_permission() => {
            tracing::debug!("Not allowed to report deployment status: {e}")
        }
        Err(e) => tracing::warn!("Failed to report deployment status: {e}"),
    }
}
