//! Async waiting for tokens.
//!
//! DESIGN
//! ======
//! A caller that can't be admitted right away parks a one-shot sender in
//! the bucket's FIFO and awaits the receiver under a timeout. The drain
//! runs on every `wait_for_tokens` call for the same key (and from
//! `process_queue` / the maintenance task); it deducts the waiter's tokens
//! and fires the sender while holding the limiter lock.
//!
//! A `WaitTicket` owns the receiver. If the future is dropped before it
//! resolves, the ticket pulls its entry out of the queue, or hands the
//! tokens back if the drain already served it.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bucket::Waiter;
use crate::config::RateLimiterConfig;
use crate::error::RateLimitError;
use crate::limiter::RateLimiter;

impl RateLimiter {
    /// Wait until `tokens` can be taken from `key`'s bucket, up to `max_wait`.
    ///
    /// `config` defaults to the global config and `max_wait` to the
    /// configured wait timeout (30s unless overridden).
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::WaitTimeout`] when `max_wait` elapses first.
    /// - [`RateLimitError::QueueCleared`] when the bucket is reset while waiting.
    pub async fn wait_for_tokens(
        &self,
        key: &str,
        tokens: u32,
        config: Option<&RateLimiterConfig>,
        max_wait: Option<Duration>,
    ) -> Result<(), RateLimitError> {
        let now = self.now_ms();
        let (mut ticket, max_wait) = {
            let mut state = self.lock();
            let cfg = config.copied().unwrap_or(state.settings.global);
            let max_wait = max_wait.unwrap_or(state.settings.wait_timeout);

            if state.check(key, tokens, cfg, now).allowed {
                return Ok(());
            }

            let id = state.next_waiter_id();
            let (notify, rx) = oneshot::channel();
            if let Some(entry) = state.scopes.get_mut(key) {
                entry
                    .bucket
                    .enqueue(Waiter { id, tokens: f64::from(tokens), notify });
                entry.stats.record_queued();
            }
            debug!(key, requested = tokens, waiter = id, "rate limit wait queued");
            // Earlier waiters may be servable now; so may this one.
            state.drain(key, now);

            let ticket = WaitTicket { limiter: self.clone(), key: key.to_owned(), id, tokens, rx, settled: false };
            (ticket, max_wait)
        };

        let waited = tokio::time::timeout(max_wait, &mut ticket.rx).await;
        let outcome = match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RateLimitError::QueueCleared { key: key.to_owned() }),
            Err(_) => ticket.expire(max_wait),
        };
        ticket.settled = true;
        outcome
    }
}

/// Handle on a queued waiter, owned by the pending future.
struct WaitTicket {
    limiter: RateLimiter,
    key: String,
    id: u64,
    tokens: u32,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl WaitTicket {
    /// Timer fired. Remove the entry, unless the drain got to it first.
    fn expire(&mut self, waited: Duration) -> Result<(), RateLimitError> {
        let mut state = self.limiter.lock();
        let removed = state
            .scopes
            .get_mut(&self.key)
            .is_some_and(|entry| {
                let removed = entry.bucket.remove_waiter(self.id);
                if removed {
                    entry.stats.record_dequeued();
                }
                removed
            });
        if removed {
            let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
            warn!(key = %self.key, requested = self.tokens, waited_ms, "rate limit wait timed out");
            return Err(RateLimitError::WaitTimeout { key: self.key.clone(), waited_ms });
        }
        // Not queued any more: either served just now or the bucket was reset.
        match self.rx.try_recv() {
            Ok(()) => Ok(()),
            Err(_) => Err(RateLimitError::QueueCleared { key: self.key.clone() }),
        }
    }
}

impl Drop for WaitTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.limiter.lock();
        let Some(entry) = state.scopes.get_mut(&self.key) else {
            return;
        };
        if entry.bucket.remove_waiter(self.id) {
            entry.stats.record_dequeued();
            debug!(key = %self.key, waiter = self.id, "abandoned rate limit wait removed");
        } else if self.rx.try_recv().is_ok() {
            entry.bucket.refund(f64::from(self.tokens));
            entry
                .stats
                .snapshot(entry.bucket.tokens(), entry.bucket.capacity());
            debug!(key = %self.key, waiter = self.id, "abandoned rate limit wait refunded");
        }
    }
}

#[cfg(test)]
#[path = "wait_test.rs"]
mod tests;
