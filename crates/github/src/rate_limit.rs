use std::{sync::Mutex, time::Duration};

use codebus_core::models::RateLimitInfo;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::error::UpstreamError;

const LIMIT: &str = "x-ratelimit-limit";
const REMAINING: &str = "x-ratelimit-remaining";
const RESET: &str = "x-ratelimit-reset";

/// Fallback used when a rate-limited response carries no usable reset information.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(60);

pub fn now() -> i64 { time::OffsetDateTime::now_utc().unix_timestamp() }

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Read the budget advertised by a response, if it carries the rate-limit headers.
pub fn info_from_headers(headers: &HeaderMap) -> Option<RateLimitInfo> {
    Some(RateLimitInfo {
        limit: header_i64(headers, LIMIT)?.max(0) as u64,
        remaining: header_i64(headers, REMAINING)?.max(0) as u64,
        reset: header_i64(headers, RESET)?,
    })
}

/// Compute how long to wait after a rate-limited response.
///
/// `retry-after` is in seconds, `x-ratelimit-reset` is an epoch timestamp. The longer
/// of the two wins; when neither yields a positive wait, `default` is used.
pub fn wait_from_headers(headers: &HeaderMap, now: i64, default: Duration) -> Duration {
    let retry_after = header_i64(headers, RETRY_AFTER.as_str()).unwrap_or_default();
    let reset = header_i64(headers, RESET).map(|reset| reset - now).unwrap_or_default();
    let secs = retry_after.max(reset);
    if secs > 0 { Duration::from_secs(secs as u64) } else { default }
}

pub fn is_exhausted(headers: &HeaderMap) -> bool { header_i64(headers, REMAINING) == Some(0) }

/// Remembers the last observed budget so calls can fail fast while it is exhausted.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    last: Mutex<Option<RateLimitInfo>>,
}

impl RateLimitTracker {
    pub fn check(&self, now: i64) -> Result<(), UpstreamError> {
        let last = self.last.lock().map(|guard| *guard).unwrap_or_default();
        match last {
            Some(info) if info.is_exhausted(now) => {
                Err(UpstreamError::RateLimited { wait: info.wait(now) })
            }
            _ => Ok(()),
        }
    }

    pub fn observe(&self, headers: &HeaderMap) {
        if let Some(info) = info_from_headers(headers) {
            self.set(info);
        }
    }

    pub fn set(&self, info: RateLimitInfo) {
        if let Ok(mut guard) = self.last.lock() {
            *guard = Some(info);
        }
    }

    pub fn last(&self) -> Option<RateLimitInfo> {
        self.last.lock().map(|guard| *guard).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn test_wait_from_headers() {
        let default = Duration::from_secs(60);
        assert_eq!(wait_from_headers(&headers(&[("retry-after", "30")]), 1000, default), Duration::from_secs(30));
        assert_eq!(
            wait_from_headers(&headers(&[("x-ratelimit-reset", "1120")]), 1000, default),
            Duration::from_secs(120)
        );
        assert_eq!(
            wait_from_headers(
                &headers(&[("retry-after", "10"), ("x-ratelimit-reset", "1020")]),
                1000,
                default
            ),
            Duration::from_secs(20)
        );
        // Zero or past values fall back to the default.
        assert_eq!(
            wait_from_headers(
                &headers(&[("retry-after", "0"), ("x-ratelimit-reset", "900")]),
                1000,
                default
            ),
            default
        );
        assert_eq!(wait_from_headers(&HeaderMap::new(), 1000, default), default);
    }

    #[test]
    fn test_tracker_fail_fast() {
        let tracker = RateLimitTracker::default();
        assert!(tracker.check(1000).is_ok());

        tracker.observe(&headers(&[
            ("x-ratelimit-limit", "5000"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", "1060"),
        ]));
        match tracker.check(1000) {
            Err(UpstreamError::RateLimited { wait }) => assert_eq!(wait, Duration::from_secs(60)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(tracker.check(1100).is_ok());

        tracker.observe(&headers(&[
            ("x-ratelimit-limit", "5000"),
            ("x-ratelimit-remaining", "4999"),
            ("x-ratelimit-reset", "4600"),
        ]));
        assert!(tracker.check(1000).is_ok());
        assert_eq!(tracker.last().map(|i| i.remaining), Some(4999));
    }
}
