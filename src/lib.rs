//! Multi-scope token-bucket rate limiting for CaseBuddy's AI and OCR calls.
//!
//! A [`RateLimiter`] keeps one lazily refilled bucket per scope key. Callers
//! check a single scope ([`RateLimiter::check_limit`] and the user / model /
//! global wrappers), all three at once ([`RateLimiter::check_combined_limit`]),
//! or wait in a per-key FIFO for tokens ([`RateLimiter::wait_for_tokens`]).
//!
//! The limiter is an explicit handle: build one at startup, clone it into
//! whatever needs it, and optionally run [`spawn_maintenance_task`] next to it.

pub mod bucket;
pub mod clock;
pub mod combined;
pub mod config;
pub mod error;
pub mod limiter;
pub mod maintenance;
pub mod stats;
mod wait;

pub use bucket::RateLimitResult;
pub use clock::{Clock, ManualClock, SystemClock};
pub use combined::{CombinedResult, LimitScope, check_rate_limit, check_user_rate_limit};
pub use config::{ConfigOverrides, LimiterSettings, RateLimiterConfig};
pub use error::{ErrorCode, RateLimitError};
pub use limiter::{GLOBAL_KEY, RateLimiter, model_key, user_key};
pub use maintenance::{MaintenanceReport, run_maintenance, spawn_maintenance_task};
pub use stats::RateLimitStats;
