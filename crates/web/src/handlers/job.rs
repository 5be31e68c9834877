use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use codebus_core::{AppError, models::Job};
use codebus_jobs::JobRunner;

use crate::handlers::job_error;

pub async fn get_job(
    State(runner): State<Arc<JobRunner>>,
    Path((owner, repo, id)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let Some(job) = runner.jobs().load(&owner, &repo, Job::CODE_TOPIC, &id).await? else {
        return Err(AppError::Status(StatusCode::NOT_FOUND));
    };
    Ok(Json(job).into_response())
}

/// Ask a running job to stop before its next sync.
pub async fn cancel_job(
    State(runner): State<Arc<JobRunner>>,
    Path((owner, repo, id)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    if !runner.jobs().cancel(&owner, &repo, Job::CODE_TOPIC, &id).await? {
        return Err(AppError::Status(StatusCode::NOT_FOUND));
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn resume_job(
    State(runner): State<Arc<JobRunner>>,
    Path((owner, repo, id)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    match runner.resume(&owner, &repo, &id).await {
        Ok(Some(job)) => Ok((StatusCode::ACCEPTED, Json(job)).into_response()),
        Ok(None) => Err(AppError::Status(StatusCode::NOT_FOUND)),
        Err(e) => Err(job_error(e, StatusCode::CONFLICT)),
    }
}
