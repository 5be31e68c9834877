use std::time::Duration;

use thiserror::Error;

use crate::rate_limit::DEFAULT_WAIT;

/// Classified failure of a call against the source-control API.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited, retry in {}s", .wait.as_secs())]
    RateLimited { wait: Duration },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unable to fetch {url}: {status}")]
    Status { status: u16, url: String },
    #[error("tree of {0} is truncated")]
    Truncated(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("invalid response from {url}")]
    Invalid {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl UpstreamError {
    /// HTTP-like status code used when recording this error on a resource.
    pub fn status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::RateLimited { .. } => 429,
            Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            Self::Status { status, .. } => *status,
            Self::Truncated(_) | Self::Invalid { .. } => 502,
            Self::Transport(_) => 503,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }

    /// Whether the error means the caller lacks access to the resource.
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Forbidden(_) | Self::NotFound(_))
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self { Self::Transport(err.to_string()) }
}

impl From<octocrab::Error> for UpstreamError {
    fn from(err: octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                Self::from_status(source.status_code.as_u16(), source.message.clone())
            }
            err => Self::Transport(err.to_string()),
        }
    }
}

impl UpstreamError {
    /// Classify an API error response that carries no rate-limit headers.
    fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            429 => Self::RateLimited { wait: DEFAULT_WAIT },
            status => Self::Status { status, url: message },
        }
    }
}
