//! Combined global + user + model admission.
//!
//! DESIGN
//! ======
//! Scopes are checked in a fixed order (global, user, model) under one lock
//! acquisition, stopping at the first denial. The caller learns which scope
//! was the binding one through `reason` / `denied_scope`.
//!
//! TRADE-OFFS
//! ==========
//! Tokens taken from scopes that passed before a later denial are kept, not
//! refunded. Under contention this throttles slightly harder than strictly
//! necessary, in exchange for a single pass with no rollback bookkeeping.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::bucket::RateLimitResult;
use crate::config::RateLimiterConfig;
use crate::error::RateLimitError;
use crate::limiter::{GLOBAL_KEY, RateLimiter, model_key, user_key};

/// Which scope denied a combined check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    Global,
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedResult {
    pub allowed: bool,
    /// Smallest remaining across checked scopes, or the denying scope's remaining.
    pub remaining: f64,
    /// Latest reset across checked scopes, or the denying scope's reset.
    pub reset_at: u64,
    /// Human-readable denial reason, e.g. `"User rate limit exceeded"`.
    pub reason: Option<String>,
    pub denied_scope: Option<LimitScope>,
}

impl CombinedResult {
    fn denied(scope: LimitScope, model: Option<&str>, result: RateLimitResult) -> Self {
        let reason = match scope {
            LimitScope::Global => "Global rate limit exceeded".to_string(),
            LimitScope::User => "User rate limit exceeded".to_string(),
            LimitScope::Model => format!("Model {} rate limit exceeded", model.unwrap_or_default()),
        };
        Self {
            allowed: false,
            remaining: result.remaining,
            reset_at: result.reset_at,
            reason: Some(reason),
            denied_scope: Some(scope),
        }
    }

    #[must_use]
    pub fn retry_after_ms(&self, now_ms: u64) -> u64 {
        self.reset_at.saturating_sub(now_ms)
    }

    /// Turn a denial into an error carrying its reason.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exceeded`] when `allowed` is false.
    pub fn into_result(self, now_ms: u64) -> Result<Self, RateLimitError> {
        if self.allowed {
            return Ok(self);
        }
        let retry_after_ms = self.retry_after_ms(now_ms);
        Err(RateLimitError::Exceeded {
            reason: self
                .reason
                .unwrap_or_else(|| "Rate limit exceeded".into()),
            retry_after_ms,
        })
    }
}

impl RateLimiter {
    /// Check global, then user, then (optionally) model limits for one request.
    pub fn check_combined_limit(&self, user_id: &str, model: Option<&str>, tokens: u32) -> CombinedResult {
        let now = self.now_ms();
        let mut state = self.lock();

        let mut scopes: Vec<(LimitScope, String, RateLimiterConfig)> = vec![
            (LimitScope::Global, GLOBAL_KEY.to_owned(), state.settings.global),
            (LimitScope::User, user_key(user_id), state.settings.user),
        ];
        if let Some(m) = model {
            scopes.push((LimitScope::Model, model_key(m), state.settings.model_config(m)));
        }

        let mut remaining = f64::INFINITY;
        let mut reset_at = 0;
        for (scope, key, cfg) in scopes {
            let result = state.check(&key, tokens, cfg, now);
            if !result.allowed {
                debug!(user_id, ?model, ?scope, "combined rate limit denied");
                return CombinedResult::denied(scope, model, result);
            }
            remaining = remaining.min(result.remaining);
            reset_at = reset_at.max(result.reset_at);
        }

        CombinedResult { allowed: true, remaining, reset_at, reason: None, denied_scope: None }
    }
}

/// Ad hoc check of `max_requests` per `window` against `key`.
pub fn check_rate_limit(limiter: &RateLimiter, key: &str, max_requests: u32, window: Duration) -> RateLimitResult {
    limiter.check_limit(key, 1, &RateLimiterConfig::per_window(max_requests, window))
}

/// Combined check for a user running `operation`; the operation name is the model scope.
pub fn check_user_rate_limit(limiter: &RateLimiter, user_id: &str, operation: &str, tokens: u32) -> CombinedResult {
    limiter.check_combined_limit(user_id, Some(operation), tokens)
}

#[cfg(test)]
#[path = "combined_test.rs"]
mod tests;
