//! Limiter error type.
//!
//! A denial is not an error: checks report it through `allowed: false`.
//! Errors cover the async wait path and config validation, plus an
//! `Exceeded` variant for callers that opt into `?` on denials.

/// Stable, machine-readable classification of an error.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    /// A queued waiter was not served within its `max_wait`.
    #[error("Rate limit wait timeout")]
    WaitTimeout { key: String, waited_ms: u64 },
    /// The waiter's bucket was reset or evicted while it was pending.
    #[error("rate limit queue cleared for {key}")]
    QueueCleared { key: String },
    /// A denial converted into an error via `into_result`.
    #[error("{reason} (retry after {retry_after_ms}ms)")]
    Exceeded { reason: String, retry_after_ms: u64 },
    #[error("invalid rate limit config: {0}")]
    InvalidConfig(String),
}

impl ErrorCode for RateLimitError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::WaitTimeout { .. } => "E_RATE_LIMIT_WAIT_TIMEOUT",
            Self::QueueCleared { .. } => "E_RATE_LIMIT_QUEUE_CLEARED",
            Self::Exceeded { .. } => "E_RATE_LIMITED",
            Self::InvalidConfig(_) => "E_RATE_LIMIT_CONFIG",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Exceeded { .. } | Self::QueueCleared { .. })
    }
}
