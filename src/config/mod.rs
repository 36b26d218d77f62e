//! Controller configuration.
//!
//! Loaded from environment variables or a TOML file. Every field has a
//! default; values that are present but malformed fail fast.

use std::hash::Hash;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::controller::DEFAULT_MAX_RETRIES;
use crate::error::{Error, Result};
use crate::queue::rate_limiter::{
    BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter,
};

/// Slowest bucket refill accepted; below this a drained bucket never recovers.
pub const MIN_QPS: f64 = 1e-3;

/// Longest per-key backoff accepted (one day).
pub const MAX_BACKOFF_MS: u64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Worker tasks per sync queue.
    pub workers: usize,
    /// Retries of a failing key before it is dropped.
    pub max_retries: u32,
    /// First per-key backoff; doubles on every consecutive failure.
    pub backoff_base_ms: u64,
    /// Cap on the per-key backoff.
    pub backoff_max_ms: u64,
    /// Sustained rate of rate-limited re-adds across all keys.
    pub qps: f64,
    /// Re-adds allowed at once before `qps` applies.
    pub burst: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: 5,
            backoff_max_ms: 1_000_000,
            qps: 10.0,
            burst: 100,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `SYNCQUEUE_*` environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            workers: parse_var("SYNCQUEUE_WORKERS")?.unwrap_or(defaults.workers),
            max_retries: parse_var("SYNCQUEUE_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            backoff_base_ms: parse_var("SYNCQUEUE_BACKOFF_BASE_MS")?
                .unwrap_or(defaults.backoff_base_ms),
            backoff_max_ms: parse_var("SYNCQUEUE_BACKOFF_MAX_MS")?
                .unwrap_or(defaults.backoff_max_ms),
            qps: parse_var("SYNCQUEUE_QPS")?.unwrap_or(defaults.qps),
            burst: parse_var("SYNCQUEUE_BURST")?.unwrap_or(defaults.burst),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.backoff_max_ms > MAX_BACKOFF_MS {
            return Err(Error::Config(format!(
                "backoff_max_ms ({}) exceeds {MAX_BACKOFF_MS}",
                self.backoff_max_ms
            )));
        }
        if !(self.qps.is_finite() && self.qps >= MIN_QPS) {
            return Err(Error::Config(format!(
                "qps must be at least {MIN_QPS}, got {}",
                self.qps
            )));
        }
        Ok(())
    }

    /// The rate limiter this configuration describes: per-key exponential
    /// backoff bounded by the overall bucket.
    pub fn rate_limiter<K>(&self) -> MaxOfRateLimiter<K>
    where
        K: Eq + Hash + Clone + Send + 'static,
    {
        MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::<K>::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
