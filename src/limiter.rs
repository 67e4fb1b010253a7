//! In-memory multi-scope rate limiter.
//!
//! DESIGN
//! ======
//! One token bucket per scope key (`global`, `user:<id>`, `model:<name>`,
//! or any ad hoc key), created lazily at full capacity on first reference.
//! Buckets and their stats share one map entry so they are created, reset
//! and evicted together.
//!
//! All state sits behind a single `Mutex`. Every mutation runs to
//! completion under the lock with no await point, so two checks never
//! interleave on a bucket. The handle is `Clone` (an `Arc` inside) and is
//! meant to be passed to whatever needs it rather than living in a global.
//!
//! TRADE-OFFS
//! ==========
//! State is process-local and lost on restart. Idle buckets are only
//! reclaimed by `evict_idle`, normally driven by the maintenance task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info};

use crate::bucket::{Bucket, RateLimitResult};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigOverrides, LimiterSettings, RateLimiterConfig};
use crate::stats::RateLimitStats;

pub const GLOBAL_KEY: &str = "global";

#[must_use]
pub fn user_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

#[must_use]
pub fn model_key(model: &str) -> String {
    format!("model:{model}")
}

// =============================================================================
// STATE
// =============================================================================

pub(crate) struct ScopeEntry {
    pub(crate) bucket: Bucket,
    pub(crate) stats: RateLimitStats,
}

pub(crate) struct LimiterState {
    pub(crate) scopes: HashMap<String, ScopeEntry>,
    pub(crate) settings: LimiterSettings,
    next_waiter_id: u64,
}

impl LimiterState {
    /// Look up `key`, creating a full bucket on first reference.
    fn entry(&mut self, key: &str, config: RateLimiterConfig, now_ms: u64) -> &mut ScopeEntry {
        let entry = self.scopes.entry(key.to_owned()).or_insert_with(|| {
            debug!(key, max_tokens = config.max_tokens, "rate limit bucket created");
            ScopeEntry { bucket: Bucket::new(config, now_ms), stats: RateLimitStats::default() }
        });
        entry.bucket.set_config(config);
        entry
    }

    pub(crate) fn check(&mut self, key: &str, tokens: u32, config: RateLimiterConfig, now_ms: u64) -> RateLimitResult {
        let entry = self.entry(key, config, now_ms);
        let result = entry.bucket.try_consume(f64::from(tokens), now_ms);
        entry.stats.record(result.allowed);
        entry
            .stats
            .snapshot(entry.bucket.tokens(), entry.bucket.capacity());
        if !result.allowed {
            debug!(key, requested = tokens, remaining = result.remaining, reset_at = result.reset_at, "rate limit denied");
        }
        result
    }

    /// Serve queued waiters on `key`. Unknown keys have nothing to drain.
    pub(crate) fn drain(&mut self, key: &str, now_ms: u64) -> usize {
        let Some(entry) = self.scopes.get_mut(key) else {
            return 0;
        };
        let served = entry.bucket.drain(now_ms);
        entry
            .stats
            .snapshot(entry.bucket.tokens(), entry.bucket.capacity());
        if served > 0 {
            debug!(key, served, waiting = entry.bucket.queue_len(), "rate limit queue drained");
        }
        served
    }

    pub(crate) fn next_waiter_id(&mut self) -> u64 {
        self.next_waiter_id += 1;
        self.next_waiter_id
    }
}

// =============================================================================
// RATE LIMITER
// =============================================================================

#[derive(Clone)]
pub struct RateLimiter {
    pub(crate) inner: Arc<Mutex<LimiterState>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(settings: LimiterSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Build a limiter that reads time from `clock` instead of the wall clock.
    #[must_use]
    pub fn with_clock(settings: LimiterSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LimiterState { scopes: HashMap::new(), settings, next_waiter_id: 0 })),
            clock,
        }
    }

    /// Defaults with optional partial overrides for the global and user scopes.
    #[must_use]
    pub fn with_overrides(global: Option<&ConfigOverrides>, user: Option<&ConfigOverrides>) -> Self {
        Self::new(LimiterSettings::with_overrides(global, user))
    }

    /// Build a limiter from `RATE_LIMIT_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let settings = LimiterSettings::from_env();
        info!(
            global_max = settings.global.max_tokens,
            user_max = settings.user.max_tokens,
            models = settings.models.len(),
            "rate limiter configured"
        );
        Self::new(settings)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current time according to the limiter's clock, in epoch ms.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    #[must_use]
    pub fn settings(&self) -> LimiterSettings {
        self.lock().settings.clone()
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Refill `key`'s bucket and try to take `tokens` from it.
    ///
    /// Never fails: a denial is reported through `allowed: false`.
    pub fn check_limit(&self, key: &str, tokens: u32, config: &RateLimiterConfig) -> RateLimitResult {
        let now = self.now_ms();
        self.lock().check(key, tokens, *config, now)
    }

    /// Check the `user:<id>` bucket against the per-user config.
    pub fn check_user_limit(&self, user_id: &str, tokens: u32) -> RateLimitResult {
        let now = self.now_ms();
        let mut state = self.lock();
        let cfg = state.settings.user;
        state.check(&user_key(user_id), tokens, cfg, now)
    }

    /// Check the `model:<name>` bucket. Unregistered models use the global config.
    pub fn check_model_limit(&self, model: &str, tokens: u32) -> RateLimitResult {
        let now = self.now_ms();
        let mut state = self.lock();
        let cfg = state.settings.model_config(model);
        state.check(&model_key(model), tokens, cfg, now)
    }

    pub fn check_global_limit(&self, tokens: u32) -> RateLimitResult {
        let now = self.now_ms();
        let mut state = self.lock();
        let cfg = state.settings.global;
        state.check(GLOBAL_KEY, tokens, cfg, now)
    }

    /// Add or replace the limit for `model`. Existing buckets pick it up on their next check.
    pub fn register_model_limit(&self, model: &str, config: RateLimiterConfig) {
        info!(%model, max_tokens = config.max_tokens, refill_rate = config.refill_rate, "model rate limit registered");
        self.lock().settings.models.insert(model.to_owned(), config);
    }

    #[must_use]
    pub fn model_config(&self, model: &str) -> RateLimiterConfig {
        self.lock().settings.model_config(model)
    }

    // -------------------------------------------------------------------------
    // Queue
    // -------------------------------------------------------------------------

    /// Serve whatever waiters on `key` the current token level allows.
    ///
    /// `wait_for_tokens` calls this itself; call it directly (or run the
    /// maintenance task) so a queue with no new arrivals still makes progress.
    pub fn process_queue(&self, key: &str) -> usize {
        let now = self.now_ms();
        self.lock().drain(key, now)
    }

    /// Drain every bucket that has waiters.
    pub fn process_all_queues(&self) -> usize {
        let now = self.now_ms();
        let mut state = self.lock();
        let keys: Vec<String> = state
            .scopes
            .iter()
            .filter(|(_, e)| e.bucket.queue_len() > 0)
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().map(|k| state.drain(k, now)).sum()
    }

    #[must_use]
    pub fn queue_len(&self, key: &str) -> usize {
        self.lock()
            .scopes
            .get(key)
            .map_or(0, |e| e.bucket.queue_len())
    }

    // -------------------------------------------------------------------------
    // Stats & lifecycle
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn stats(&self, key: &str) -> Option<RateLimitStats> {
        self.lock().scopes.get(key).map(|e| e.stats)
    }

    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, RateLimitStats> {
        self.lock()
            .scopes
            .iter()
            .map(|(k, e)| (k.clone(), e.stats))
            .collect()
    }

    #[must_use]
    pub fn tracked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().scopes.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Forget `key`'s bucket and stats. Pending waiters are rejected with
    /// `QueueCleared`. Returns whether the key was tracked.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.lock().scopes.remove(key);
        if let Some(entry) = &removed {
            info!(key, dropped_waiters = entry.bucket.queue_len(), "rate limit reset");
        }
        removed.is_some()
    }

    pub fn reset_all(&self) {
        let mut state = self.lock();
        let count = state.scopes.len();
        state.scopes.clear();
        info!(count, "rate limit state cleared");
    }

    /// Drop buckets with no waiters that nothing has touched for `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.now_ms();
        let max_idle_ms = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let mut state = self.lock();
        let before = state.scopes.len();
        state
            .scopes
            .retain(|_, e| !e.bucket.is_idle(now, max_idle_ms));
        let evicted = before - state.scopes.len();
        if evicted > 0 {
            debug!(evicted, remaining = state.scopes.len(), "evicted idle rate limit buckets");
        }
        evicted
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimiterSettings::default())
    }
}

#[cfg(test)]
#[path = "limiter_test.rs"]
mod tests;
