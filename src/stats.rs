//! Per-scope counters.

use serde::Serialize;

/// Counters for one scope key, created alongside its bucket.
///
/// `total_requests == allowed_requests + denied_requests` always holds.
/// `queued_requests` counts denials that went on to wait in the queue; it
/// drops again when a waiter times out or is abandoned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateLimitStats {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub queued_requests: u64,
    pub current_tokens: f64,
    pub max_tokens: f64,
}

impl RateLimitStats {
    pub(crate) fn record(&mut self, allowed: bool) {
        self.total_requests += 1;
        if allowed {
            self.allowed_requests += 1;
        } else {
            self.denied_requests += 1;
        }
    }

    pub(crate) fn record_queued(&mut self) {
        self.queued_requests += 1;
    }

    pub(crate) fn record_dequeued(&mut self) {
        self.queued_requests = self.queued_requests.saturating_sub(1);
    }

    pub(crate) fn snapshot(&mut self, current_tokens: f64, max_tokens: f64) {
        self.current_tokens = current_tokens;
        self.max_tokens = max_tokens;
    }
}
