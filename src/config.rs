//! Limiter configuration.
//!
//! DESIGN
//! ======
//! Three scope classes share one config shape: the global bucket, the
//! per-user default, and per-model overrides keyed by model identifier.
//! Defaults live in constants; `LimiterSettings::from_env` layers
//! `RATE_LIMIT_*` environment variables on top. Unparseable or invalid
//! values fall back to the defaults with a warning instead of failing
//! startup.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RateLimitError;

pub const DEFAULT_GLOBAL_LIMIT: RateLimiterConfig = RateLimiterConfig::new(100.0, 10.0, 60_000);
pub const DEFAULT_USER_LIMIT: RateLimiterConfig = RateLimiterConfig::new(20.0, 5.0, 60_000);

pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TTL_SECS: u64 = 3600;
pub const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 1000;

/// Built-in per-model limits for the AI backends the app talks to.
const DEFAULT_MODEL_LIMITS: &[(&str, RateLimiterConfig)] = &[
    ("gpt-4o", RateLimiterConfig::new(50.0, 10.0, 60_000)),
    ("gpt-4o-mini", RateLimiterConfig::new(200.0, 50.0, 60_000)),
    ("gpt-4-turbo", RateLimiterConfig::new(30.0, 5.0, 60_000)),
    ("claude-3-5-sonnet", RateLimiterConfig::new(50.0, 10.0, 60_000)),
    ("gemini-1.5-pro", RateLimiterConfig::new(60.0, 15.0, 60_000)),
];

// =============================================================================
// BUCKET CONFIG
// =============================================================================

/// Capacity and refill schedule for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Capacity ceiling; new buckets start full.
    pub max_tokens: f64,
    /// Tokens added per elapsed `refill_interval_ms`.
    pub refill_rate: f64,
    /// Length of one refill tick in milliseconds.
    pub refill_interval_ms: u64,
}

impl RateLimiterConfig {
    #[must_use]
    pub const fn new(max_tokens: f64, refill_rate: f64, refill_interval_ms: u64) -> Self {
        Self { max_tokens, refill_rate, refill_interval_ms }
    }

    /// Fixed-window style config: `max_requests` per `window`, refilled all at once.
    #[must_use]
    pub fn per_window(max_requests: u32, window: Duration) -> Self {
        let max = f64::from(max_requests);
        Self::new(max, max, u64::try_from(window.as_millis()).unwrap_or(u64::MAX))
    }

    #[must_use]
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    /// Reject configs the refill math cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::InvalidConfig`] for a non-positive capacity or
    /// refill rate, or a zero refill interval.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if !(self.max_tokens.is_finite() && self.max_tokens > 0.0) {
            return Err(RateLimitError::InvalidConfig(format!("max_tokens must be positive, got {}", self.max_tokens)));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(RateLimitError::InvalidConfig(format!(
                "refill_rate must be positive, got {}",
                self.refill_rate
            )));
        }
        if self.refill_interval_ms == 0 {
            return Err(RateLimitError::InvalidConfig("refill_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Apply partial overrides on top of this config.
    #[must_use]
    pub fn merged(self, overrides: &ConfigOverrides) -> Self {
        Self {
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
            refill_rate: overrides.refill_rate.unwrap_or(self.refill_rate),
            refill_interval_ms: overrides.refill_interval_ms.unwrap_or(self.refill_interval_ms),
        }
    }
}

/// Partial config; unset fields keep the base value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub max_tokens: Option<f64>,
    pub refill_rate: Option<f64>,
    pub refill_interval_ms: Option<u64>,
}

// =============================================================================
// LIMITER SETTINGS
// =============================================================================

/// Everything a `RateLimiter` needs at construction time.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterSettings {
    pub global: RateLimiterConfig,
    pub user: RateLimiterConfig,
    /// Per-model overrides. Models without an entry use `global`.
    pub models: HashMap<String, RateLimiterConfig>,
    /// Default `max_wait` for `wait_for_tokens`.
    pub wait_timeout: Duration,
    /// Buckets idle longer than this are evicted by maintenance.
    pub idle_ttl: Duration,
    /// Period of the background drain/evict loop.
    pub maintenance_interval: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            global: DEFAULT_GLOBAL_LIMIT,
            user: DEFAULT_USER_LIMIT,
            models: default_model_limits(),
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
            maintenance_interval: Duration::from_millis(DEFAULT_MAINTENANCE_INTERVAL_MS),
        }
    }
}

impl LimiterSettings {
    /// Defaults with optional global/user overrides merged in.
    #[must_use]
    pub fn with_overrides(global: Option<&ConfigOverrides>, user: Option<&ConfigOverrides>) -> Self {
        let mut settings = Self::default();
        if let Some(o) = global {
            settings.global = settings.global.merged(o);
        }
        if let Some(o) = user {
            settings.user = settings.user.merged(o);
        }
        settings
    }

    /// Build settings from environment variables.
    ///
    /// Optional:
    /// - `RATE_LIMIT_GLOBAL_MAX_TOKENS`, `RATE_LIMIT_GLOBAL_REFILL_RATE`,
    ///   `RATE_LIMIT_GLOBAL_REFILL_INTERVAL_MS`
    /// - `RATE_LIMIT_USER_MAX_TOKENS`, `RATE_LIMIT_USER_REFILL_RATE`,
    ///   `RATE_LIMIT_USER_REFILL_INTERVAL_MS`
    /// - `RATE_LIMIT_MODEL_OVERRIDES`: JSON object of model -> config
    /// - `RATE_LIMIT_WAIT_TIMEOUT_MS`: default 30000
    /// - `RATE_LIMIT_IDLE_TTL_SECS`: default 3600
    /// - `RATE_LIMIT_MAINTENANCE_INTERVAL_MS`: default 1000
    #[must_use]
    pub fn from_env() -> Self {
        let global = scope_from_env("GLOBAL", DEFAULT_GLOBAL_LIMIT);
        let user = scope_from_env("USER", DEFAULT_USER_LIMIT);

        let mut models = default_model_limits();
        if let Ok(raw) = std::env::var("RATE_LIMIT_MODEL_OVERRIDES") {
            match serde_json::from_str::<HashMap<String, RateLimiterConfig>>(&raw) {
                Ok(parsed) => {
                    for (model, cfg) in parsed {
                        match cfg.validate() {
                            Ok(()) => {
                                models.insert(model, cfg);
                            }
                            Err(e) => warn!(%model, error = %e, "ignoring invalid model rate limit"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "RATE_LIMIT_MODEL_OVERRIDES is not valid JSON; using defaults"),
            }
        }

        Self {
            global,
            user,
            models,
            wait_timeout: Duration::from_millis(env_parse("RATE_LIMIT_WAIT_TIMEOUT_MS", DEFAULT_WAIT_TIMEOUT_MS)),
            idle_ttl: Duration::from_secs(env_parse("RATE_LIMIT_IDLE_TTL_SECS", DEFAULT_IDLE_TTL_SECS)),
            maintenance_interval: Duration::from_millis(env_parse(
                "RATE_LIMIT_MAINTENANCE_INTERVAL_MS",
                DEFAULT_MAINTENANCE_INTERVAL_MS,
            )),
        }
    }

    /// Config for `model`, falling back to the global config.
    #[must_use]
    pub fn model_config(&self, model: &str) -> RateLimiterConfig {
        self.models.get(model).copied().unwrap_or(self.global)
    }
}

#[must_use]
pub fn default_model_limits() -> HashMap<String, RateLimiterConfig> {
    DEFAULT_MODEL_LIMITS
        .iter()
        .map(|(model, cfg)| ((*model).to_string(), *cfg))
        .collect()
}

fn scope_from_env(scope: &str, default: RateLimiterConfig) -> RateLimiterConfig {
    let cfg = RateLimiterConfig {
        max_tokens: env_parse(&format!("RATE_LIMIT_{scope}_MAX_TOKENS"), default.max_tokens),
        refill_rate: env_parse(&format!("RATE_LIMIT_{scope}_REFILL_RATE"), default.refill_rate),
        refill_interval_ms: env_parse(&format!("RATE_LIMIT_{scope}_REFILL_INTERVAL_MS"), default.refill_interval_ms),
    };
    match cfg.validate() {
        Ok(()) => cfg,
        Err(e) => {
            warn!(scope, error = %e, "invalid rate limit env config; using defaults");
            default
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
