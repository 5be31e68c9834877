use std::{fmt::Display, time::Duration};

use codebus_github::UpstreamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// The job should be re-invoked once the wait has elapsed.
    #[error("rate limited, retry in {}s", .wait.as_secs())]
    RateLimited { wait: Duration },
    /// The job cannot make progress.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl JobError {
    pub fn fatal(message: impl Display) -> Self { Self::Fatal(anyhow::anyhow!("{message}")) }

    /// Classify an upstream failure, attaching `context` to non-retryable errors.
    pub fn upstream(err: UpstreamError, context: impl Display) -> Self {
        match err {
            UpstreamError::RateLimited { wait } => Self::RateLimited { wait },
            err => Self::Fatal(anyhow::Error::new(err).context(context.to_string())),
        }
    }

    pub fn is_rate_limited(&self) -> bool { matches!(self, Self::RateLimited { .. }) }
}

impl From<UpstreamError> for JobError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::RateLimited { wait } => Self::RateLimited { wait },
            err => Self::Fatal(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_classification() {
        let err = JobError::upstream(
            UpstreamError::RateLimited { wait: Duration::from_secs(5) },
            "unable to fetch tree",
        );
        assert!(matches!(err, JobError::RateLimited { wait } if wait == Duration::from_secs(5)));

        let err = JobError::upstream(
            UpstreamError::Unauthorized("https://api/x".to_string()),
            "unable to fetch tree of owner/repo/main",
        );
        assert!(!err.is_rate_limited());
        assert_eq!(format!("{err:#}"), "unable to fetch tree of owner/repo/main: unauthorized: https://api/x");
    }
}
