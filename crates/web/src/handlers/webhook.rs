use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use codebus_core::AppError;
use codebus_github::webhook::GitHubEvent;
use codebus_jobs::JobRunner;

use crate::handlers::job_error;

/// Webhook handler that starts a code job for push, create and delete events.
pub async fn webhook(
    State(runner): State<Arc<JobRunner>>,
    event: GitHubEvent,
) -> Result<Response, AppError> {
    let kind = event.event.clone();
    let Some(data) = event.into_job_data().map_err(|e| {
        tracing::warn!("Received invalid {kind} event: {e:#}");
        AppError::Message(StatusCode::BAD_REQUEST, format!("{e:#}"))
    })?
    else {
        tracing::debug!("Ignoring webhook event {kind}");
        return Ok((StatusCode::OK, "Event ignored").into_response());
    };
    tracing::info!(
        "Received {kind} event for {}/{} ref {} ({:?})",
        data.owner,
        data.repo,
        data.code_ref,
        data.kind
    );
    let job = runner.submit(data).await.map_err(|e| job_error(e, StatusCode::BAD_REQUEST))?;
    Ok((StatusCode::ACCEPTED, Json(job)).into_response())
}
