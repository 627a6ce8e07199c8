//! Typed error kinds for the aggregation core. None of these cross a public
//! contract boundary for expected degradations (filter, timeout, source
//! outage) — those are folded into the returned report/analysis instead.
//! `CoreError` exists for residual invariant-violation cases and for
//! plumbing inside a single stage call.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("source unavailable")]
    Unavailable,

    #[error("rate limited")]
    RateLimited(Option<Duration>),

    #[error("rejected with status {0}")]
    Rejected(u16),

    #[error("contract mismatch: {0}")]
    ContractMismatch(String),

    #[error("timeout")]
    Timeout,
}

impl StageError {
    /// Whether `RateLimiter::execute` should retry this failure. A 429 or a
    /// 5xx is transient; any other 4xx means the request itself is wrong
    /// and retrying it will never help.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Transport(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(true)
            }
            StageError::Unavailable => true,
            StageError::RateLimited(_) => true,
            StageError::Rejected(_) => false,
            StageError::Timeout => true,
            StageError::ContractMismatch(_) => false,
        }
    }

    /// The server-suggested delay before retrying, if this error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StageError::RateLimited(d) => *d,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
