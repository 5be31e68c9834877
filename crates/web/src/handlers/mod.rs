use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use codebus_core::AppError;
use codebus_jobs::JobError;

use crate::AppState;

mod code;
mod job;
mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/webhook", post(webhook::webhook))
        .route("/code/{owner}/{repo}/{*ref}", post(code::sync))
        .route("/job/{owner}/{repo}/{id}", get(job::get_job).delete(job::cancel_job))
        .route("/job/{owner}/{repo}/{id}/resume", post(job::resume_job))
}

/// Map a refused job to `status`; rate limits always map to 429.
pub fn job_error(err: JobError, status: StatusCode) -> AppError {
    match err {
        JobError::RateLimited { wait } => AppError::Message(
            StatusCode::TOO_MANY_REQUESTS,
            format!("rate limited, retry in {}s", wait.as_secs()),
        ),
        JobError::Fatal(e) => AppError::Message(status, format!("{e:#}")),
    }
}
