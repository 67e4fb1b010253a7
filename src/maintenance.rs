//! Background upkeep for a limiter.
//!
//! DESIGN
//! ======
//! Queues only drain when something calls into the same key, so a bucket
//! whose waiters see no new arrivals would stall until they time out. The
//! maintenance task drains every queue on a fixed tick and evicts buckets
//! that have sat idle past the configured TTL, which also keeps per-key
//! state from growing without bound.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::limiter::RateLimiter;

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub served: usize,
    pub evicted: usize,
}

/// Run one drain + evict pass.
pub fn run_maintenance(limiter: &RateLimiter, idle_ttl: Duration) -> MaintenanceReport {
    let served = limiter.process_all_queues();
    let evicted = limiter.evict_idle(idle_ttl);
    if served > 0 || evicted > 0 {
        debug!(served, evicted, "rate limit maintenance pass");
    }
    MaintenanceReport { served, evicted }
}

/// Spawn the background maintenance task. Abort the handle to stop it.
pub fn spawn_maintenance_task(limiter: RateLimiter) -> JoinHandle<()> {
    let settings = limiter.settings();
    let period = settings.maintenance_interval.max(Duration::from_millis(1));
    let idle_ttl = settings.idle_ttl;
    info!(
        interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        idle_ttl_secs = idle_ttl.as_secs(),
        "rate limit maintenance started"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_maintenance(&limiter, idle_ttl);
        }
    })
}

#[cfg(test)]
#[path = "maintenance_test.rs"]
mod tests;
