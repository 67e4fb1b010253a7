//! Burst simulator: replays a run of AI requests against a limiter built from
//! the environment and prints the resulting per-scope stats as JSON.

use std::collections::BTreeMap;
use std::time::Duration;

use casebuddy_limits::{RateLimiter, spawn_maintenance_task, user_key};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let user_id = std::env::var("DEMO_USER").unwrap_or_else(|_| "demo-user".into());
    let model = std::env::var("DEMO_MODEL").unwrap_or_else(|_| "gpt-4o".into());
    let burst: u32 = std::env::var("DEMO_BURST")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(25);

    let limiter = RateLimiter::from_env();
    let maintenance = spawn_maintenance_task(limiter.clone());

    for i in 0..burst {
        let result = limiter.check_combined_limit(&user_id, Some(&model), 1);
        if result.allowed {
            tracing::info!(i, remaining = result.remaining, "request admitted");
        } else {
            tracing::warn!(
                i,
                reason = result.reason.as_deref().unwrap_or_default(),
                retry_after_ms = result.retry_after_ms(limiter.now_ms()),
                "request denied"
            );
        }
    }

    let user_cfg = limiter.settings().user;
    match limiter
        .wait_for_tokens(&user_key(&user_id), 1, Some(&user_cfg), Some(Duration::from_millis(200)))
        .await
    {
        Ok(()) => tracing::info!("queued request admitted"),
        Err(e) => tracing::warn!(error = %e, "queued request gave up"),
    }
    maintenance.abort();

    let stats: BTreeMap<_, _> = limiter.all_stats().into_iter().collect();
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "failed to serialize stats"),
    }
}
