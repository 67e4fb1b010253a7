#![allow(clippy::float_cmp)]

use super::*;
use std::sync::Arc;

use crate::clock::ManualClock;
use crate::config::LimiterSettings;

fn limiter_at(start_ms: u64) -> (RateLimiter, ManualClock) {
    let clock = ManualClock::new(start_ms);
    let limiter = RateLimiter::with_clock(LimiterSettings::default(), Arc::new(clock.clone()));
    (limiter, clock)
}

async fn wait_until_queued(limiter: &RateLimiter, key: &str, n: usize) {
    while limiter.queue_len(key) < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn resolves_immediately_when_tokens_available() {
    let (limiter, _clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(2.0, 1.0, 1000);
    limiter
        .wait_for_tokens("k", 1, Some(&cfg), Some(Duration::from_millis(10)))
        .await
        .unwrap();
    assert_eq!(limiter.queue_len("k"), 0);
    assert_eq!(limiter.stats("k").unwrap().queued_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn unsatisfiable_request_times_out() {
    let (limiter, _clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(2.0, 1.0, 1000);

    let err = limiter
        .wait_for_tokens("k", 3, Some(&cfg), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Rate limit wait timeout");
    assert!(matches!(err, RateLimitError::WaitTimeout { waited_ms: 50, .. }));
    assert_eq!(limiter.queue_len("k"), 0);
    let stats = limiter.stats("k").unwrap();
    assert_eq!(stats.queued_requests, 0);
    assert_eq!(stats.denied_requests, 1);
    assert_eq!(stats.total_requests, stats.allowed_requests + stats.denied_requests);
}

#[tokio::test]
async fn zero_max_wait_rejects_without_waiting() {
    let (limiter, _clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(1.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 1, &cfg).allowed);

    let err = limiter
        .wait_for_tokens("k", 1, Some(&cfg), Some(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, RateLimitError::WaitTimeout { .. }));
    assert_eq!(limiter.queue_len("k"), 0);
}

#[tokio::test]
async fn waiters_resolve_in_arrival_order() {
    let (limiter, clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(3.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 3, &cfg).allowed);

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    for id in 1..=3usize {
        let task_limiter = limiter.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            task_limiter
                .wait_for_tokens("k", 1, Some(&cfg), Some(Duration::from_secs(30)))
                .await
                .unwrap();
            done_tx.send(id).unwrap();
        });
        wait_until_queued(&limiter, "k", id).await;
    }

    for expected in 1..=3usize {
        clock.advance(Duration::from_millis(1000));
        assert_eq!(limiter.process_queue("k"), 1);
        assert_eq!(done_rx.recv().await, Some(expected));
    }
    assert_eq!(limiter.queue_len("k"), 0);
    assert_eq!(limiter.stats("k").unwrap().queued_requests, 3);
}

#[tokio::test]
async fn new_wait_call_drains_earlier_waiter() {
    let (limiter, clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(2.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 2, &cfg).allowed);

    let first = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .wait_for_tokens("k", 1, Some(&cfg), Some(Duration::from_secs(30)))
                .await
        })
    };
    wait_until_queued(&limiter, "k", 1).await;

    // One token refills; the bigger second request queues behind the first
    // and its drain serves the first.
    clock.advance(Duration::from_millis(1000));
    let second = limiter
        .wait_for_tokens("k", 2, Some(&cfg), Some(Duration::from_millis(20)))
        .await;

    assert!(first.await.unwrap().is_ok());
    assert!(matches!(second, Err(RateLimitError::WaitTimeout { .. })));
}

#[tokio::test]
async fn large_head_blocks_smaller_waiters_behind_it() {
    let (limiter, clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(4.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 4, &cfg).allowed);

    let big = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .wait_for_tokens("k", 3, Some(&cfg), Some(Duration::from_secs(30)))
                .await
        })
    };
    wait_until_queued(&limiter, "k", 1).await;
    let small = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .wait_for_tokens("k", 1, Some(&cfg), Some(Duration::from_secs(30)))
                .await
        })
    };
    wait_until_queued(&limiter, "k", 2).await;

    clock.advance(Duration::from_millis(2000));
    assert_eq!(limiter.process_queue("k"), 0);
    assert_eq!(limiter.queue_len("k"), 2);

    clock.advance(Duration::from_millis(2000));
    assert_eq!(limiter.process_queue("k"), 2);
    assert!(big.await.unwrap().is_ok());
    assert!(small.await.unwrap().is_ok());
}

#[tokio::test]
async fn reset_rejects_pending_waiters() {
    let (limiter, _clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(1.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 1, &cfg).allowed);

    let pending = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .wait_for_tokens("k", 1, Some(&cfg), Some(Duration::from_secs(30)))
                .await
        })
    };
    wait_until_queued(&limiter, "k", 1).await;

    assert!(limiter.reset("k"));
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, RateLimitError::QueueCleared { key: "k".into() });
}

#[tokio::test]
async fn dropped_wait_leaves_the_queue() {
    let (limiter, _clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(1.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 1, &cfg).allowed);

    let pending = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .wait_for_tokens("k", 1, Some(&cfg), Some(Duration::from_secs(30)))
                .await
        })
    };
    wait_until_queued(&limiter, "k", 1).await;
    assert_eq!(limiter.stats("k").unwrap().queued_requests, 1);

    pending.abort();
    let _ = pending.await;

    assert_eq!(limiter.queue_len("k"), 0);
    assert_eq!(limiter.stats("k").unwrap().queued_requests, 0);
}

#[tokio::test]
async fn default_config_is_global() {
    let (limiter, _clock) = limiter_at(0);
    limiter
        .wait_for_tokens("adhoc", 1, None, None)
        .await
        .unwrap();
    let stats = limiter.stats("adhoc").unwrap();
    assert!((stats.max_tokens - 100.0).abs() < f64::EPSILON);
    assert!((stats.current_tokens - 99.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn served_waiter_succeeds_even_when_timer_also_fires() {
    let (limiter, clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(1.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 1, &cfg).allowed);

    let pending = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .wait_for_tokens("k", 1, Some(&cfg), Some(Duration::from_millis(100)))
                .await
        })
    };
    wait_until_queued(&limiter, "k", 1).await;

    // Serve the waiter, then let its deadline pass before it is polled again.
    clock.advance(Duration::from_millis(1000));
    assert_eq!(limiter.process_queue("k"), 1);
    tokio::time::advance(Duration::from_millis(200)).await;

    assert!(pending.await.unwrap().is_ok());
    let stats = limiter.stats("k").unwrap();
    assert_eq!(stats.queued_requests, 1);
    assert_eq!(stats.current_tokens, 0.0);
}

fn queued_ticket(limiter: &RateLimiter, key: &str, tokens: u32) -> WaitTicket {
    let mut state = limiter.lock();
    let id = state.next_waiter_id();
    let (notify, rx) = oneshot::channel();
    let entry = state.scopes.get_mut(key).unwrap();
    entry
        .bucket
        .enqueue(Waiter { id, tokens: f64::from(tokens), notify });
    entry.stats.record_queued();
    WaitTicket { limiter: limiter.clone(), key: key.to_owned(), id, tokens, rx, settled: false }
}

#[test]
fn expire_after_serve_reports_success() {
    let (limiter, clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(1.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 1, &cfg).allowed);

    let mut ticket = queued_ticket(&limiter, "k", 1);
    clock.advance(Duration::from_millis(1000));
    assert_eq!(limiter.process_queue("k"), 1);

    assert_eq!(ticket.expire(Duration::from_millis(100)), Ok(()));
    ticket.settled = true;
    assert_eq!(limiter.stats("k").unwrap().current_tokens, 0.0);
}

#[test]
fn expire_after_reset_reports_queue_cleared() {
    let (limiter, _clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(1.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 1, &cfg).allowed);

    let mut ticket = queued_ticket(&limiter, "k", 1);
    assert!(limiter.reset("k"));

    assert_eq!(ticket.expire(Duration::from_millis(100)), Err(RateLimitError::QueueCleared { key: "k".into() }));
    ticket.settled = true;
}

#[tokio::test]
async fn served_then_dropped_wait_refunds_tokens() {
    let (limiter, clock) = limiter_at(0);
    let cfg = RateLimiterConfig::new(1.0, 1.0, 1000);
    assert!(limiter.check_limit("k", 1, &cfg).allowed);

    let pending = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .wait_for_tokens("k", 1, Some(&cfg), Some(Duration::from_secs(30)))
                .await
        })
    };
    wait_until_queued(&limiter, "k", 1).await;

    clock.advance(Duration::from_millis(1000));
    assert_eq!(limiter.process_queue("k"), 1);
    assert_eq!(limiter.stats("k").unwrap().current_tokens, 0.0);

    // Cancel before the task observes that it was served.
    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());

    assert_eq!(limiter.lock().scopes["k"].bucket.tokens(), 1.0);
    let stats = limiter.stats("k").unwrap();
    assert_eq!(stats.current_tokens, 1.0);
    assert_eq!(stats.max_tokens, 1.0);
    assert!(limiter.check_limit("k", 1, &cfg).allowed);
}
