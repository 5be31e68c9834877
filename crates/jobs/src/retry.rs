use std::{future::Future, time::Duration};

use codebus_core::models::Job;
use codebus_github::UpstreamError;
use tokio::time::sleep;

use crate::{JobContext, error::JobError, job};

/// Run a single upstream call, waiting out rate limits as long as the accumulated
/// wait stays within `max_wait`.
pub async fn with_retry<T, F, Fut>(max_wait: Duration, mut call: F) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut waited = Duration::ZERO;
    loop {
        match call().await {
            Err(UpstreamError::RateLimited { wait }) if waited + wait <= max_wait => {
                tracing::warn!("Rate limited, retrying in {}ms", wait.as_millis());
                sleep(wait).await;
                waited += wait;
            }
            result => return result,
        }
    }
}

/// Drive a job to completion, re-invoking it after every rate-limit wait.
///
/// Each wait is added to `state.waiting` and persisted before sleeping, so a resumed
/// job can tell a retry loop apart from an interrupted collect phase. Once the wait
/// of this invocation would exceed the configured maximum, the pending wait is
/// recorded the same way and the rate limit is returned, leaving the job for a
/// later invocation.
pub async fn run_with_retry(job: &mut Job, ctx: &JobContext) -> Result<(), JobError> {
    let max_wait = ctx.config.max_retry_wait();
    let mut waited = Duration::ZERO;
    loop {
        match job::run(job, ctx).await {
            Err(JobError::RateLimited { wait }) => {
                let wait = wait.max(Duration::from_millis(1));
                job.state.waiting += wait.as_millis() as u64;
                job::save(job, ctx).await?;
                if waited + wait > max_wait {
                    tracing::warn!(
                        phase = %job.state.phase,
                        "Giving up after waiting {}s for rate limits (next wait {}s)",
                        waited.as_secs(),
                        wait.as_secs()
                    );
                    return Err(JobError::RateLimited { wait });
                }
                tracing::info!(
                    phase = %job.state.phase,
                    "Rate limited, resuming in {}ms",
                    wait.as_millis()
                );
                sleep(wait).await;
                waited += wait;
            }
            result => return result,
        }
    }
}
