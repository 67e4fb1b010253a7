//! Token bucket state for one scope key.
//!
//! DESIGN
//! ======
//! Refill is lazy: nothing runs between calls. Each check first credits
//! `floor(elapsed / interval) * refill_rate` tokens and moves `last_refill`
//! forward by exactly the credited whole intervals, so a leftover partial
//! interval still counts toward the next tick. Frequent small calls can't
//! starve the refill that way.
//!
//! Waiters sit in a FIFO next to the tokens they compete for. The drain
//! serves the head only; a large request at the front blocks smaller ones
//! behind it.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::RateLimiterConfig;
use crate::error::RateLimitError;

/// Outcome of a single-scope admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Tokens left after this check.
    pub remaining: f64,
    /// Epoch ms. Next refill tick when allowed, estimated time enough tokens exist when denied.
    pub reset_at: u64,
}

impl RateLimitResult {
    /// Milliseconds from `now_ms` until `reset_at`.
    #[must_use]
    pub fn retry_after_ms(&self, now_ms: u64) -> u64 {
        self.reset_at.saturating_sub(now_ms)
    }

    /// Turn a denial into an error for `?` propagation.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exceeded`] when `allowed` is false.
    pub fn into_result(self, now_ms: u64) -> Result<Self, RateLimitError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitError::Exceeded {
                reason: "Rate limit exceeded".into(),
                retry_after_ms: self.retry_after_ms(now_ms),
            })
        }
    }
}

/// Token ceiling for `config`. Negative or NaN capacities collapse to zero.
fn capacity(config: RateLimiterConfig) -> f64 {
    config.max_tokens.max(0.0)
}

/// A pending `wait_for_tokens` call.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) tokens: f64,
    pub(crate) notify: oneshot::Sender<()>,
}

#[derive(Debug)]
pub(crate) struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
    /// Last time anything touched this bucket; drives idle eviction.
    last_access_ms: u64,
    /// Config from the most recent check. Drains reuse it.
    config: RateLimiterConfig,
    queue: VecDeque<Waiter>,
}

impl Bucket {
    pub(crate) fn new(config: RateLimiterConfig, now_ms: u64) -> Self {
        Self {
            tokens: capacity(config),
            last_refill_ms: now_ms,
            last_access_ms: now_ms,
            config,
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Token ceiling under the current config.
    pub(crate) fn capacity(&self) -> f64 {
        capacity(self.config)
    }

    pub(crate) fn set_config(&mut self, config: RateLimiterConfig) {
        self.config = config;
        self.tokens = self.tokens.min(capacity(config));
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Credit whole elapsed intervals, clamped to capacity.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn refill(&mut self, now_ms: u64) {
        self.last_access_ms = self.last_access_ms.max(now_ms);
        let cfg = self.config;
        if now_ms <= self.last_refill_ms {
            return;
        }
        if cfg.refill_interval_ms == 0 {
            self.tokens = capacity(cfg);
            self.last_refill_ms = now_ms;
            return;
        }

        let periods = (now_ms - self.last_refill_ms) / cfg.refill_interval_ms;
        if periods == 0 {
            return;
        }
        let credit = periods as f64 * cfg.refill_rate;
        self.tokens = (self.tokens + credit).min(capacity(cfg)).max(0.0);
        self.last_refill_ms += periods * cfg.refill_interval_ms;
    }

    /// Refill, then deduct `requested` if available.
    pub(crate) fn try_consume(&mut self, requested: f64, now_ms: u64) -> RateLimitResult {
        self.refill(now_ms);
        if self.tokens >= requested {
            self.tokens -= requested;
            RateLimitResult {
                allowed: true,
                remaining: self.tokens,
                reset_at: now_ms.saturating_add(self.config.refill_interval_ms),
            }
        } else {
            RateLimitResult { allowed: false, remaining: self.tokens, reset_at: self.estimate_ready_at(requested, now_ms) }
        }
    }

    /// When `requested` tokens will exist, assuming no other consumer.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn estimate_ready_at(&self, requested: f64, now_ms: u64) -> u64 {
        let cfg = self.config;
        if cfg.refill_rate <= 0.0 || !cfg.refill_rate.is_finite() {
            return u64::MAX;
        }
        let periods = ((requested - self.tokens) / cfg.refill_rate).ceil().max(0.0) as u64;
        now_ms.saturating_add(periods.saturating_mul(cfg.refill_interval_ms))
    }

    pub(crate) fn enqueue(&mut self, waiter: Waiter) {
        self.queue.push_back(waiter);
    }

    /// Remove a waiter wherever it sits. Returns `false` if it is no longer queued.
    pub(crate) fn remove_waiter(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Give tokens back, e.g. when a served waiter was abandoned.
    pub(crate) fn refund(&mut self, tokens: f64) {
        self.tokens = (self.tokens + tokens).min(capacity(self.config));
    }

    /// Serve waiters from the head while tokens allow. Returns how many were served.
    pub(crate) fn drain(&mut self, now_ms: u64) -> usize {
        self.refill(now_ms);
        let mut served = 0;
        while self.queue.front().is_some_and(|head| self.tokens >= head.tokens) {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.tokens -= waiter.tokens;
            if waiter.notify.send(()).is_err() {
                // Receiver already gone; nobody will use these tokens.
                self.refund(waiter.tokens);
                continue;
            }
            served += 1;
        }
        served
    }

    pub(crate) fn is_idle(&self, now_ms: u64, max_idle_ms: u64) -> bool {
        self.queue.is_empty() && now_ms.saturating_sub(self.last_access_ms) >= max_idle_ms
    }
}

#[cfg(test)]
#[path = "bucket_test.rs"]
mod tests;
