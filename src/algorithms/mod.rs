// src/algorithms/mod.rs

pub mod sliding_window;
pub mod token_bucket;

#[cfg(test)]
mod tests;

pub use sliding_window::{SlidingWindow, SlidingWindowBuilder};
pub use token_bucket::{TokenBucket, TokenBucketBuilder};

use super::config::AlgorithmConfig;
use super::error::{RateLimiterError, Result};
use super::storage::WindowedStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a single admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Whether the request was allowed
    pub allowed: bool,

    /// Configured capacity (burst for token bucket, window limit for sliding window)
    pub limit: u64,

    /// Capacity left after this check
    pub remaining: u64,

    /// When capacity is expected to be available again
    pub reset_at: DateTime<Utc>,
}

impl RateLimitStatus {
    /// Zero when allowed, otherwise the time until `reset_at`.
    ///
    /// The value can be zero or negative when the reset is already past;
    /// clamp it before putting it in a header.
    pub fn retry_after(&self) -> TimeDelta {
        if self.allowed {
            TimeDelta::zero()
        } else {
            self.reset_at - Utc::now()
        }
    }

    /// Converts a denial into [`RateLimiterError::LimitExceeded`] for callers
    /// that prefer `?` over inspecting `allowed`.
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimiterError::LimitExceeded(format!(
                "limit of {} reached, resets at {}",
                self.limit,
                self.reset_at.to_rfc3339()
            )))
        }
    }
}

/// Admission control keyed by an opaque string
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Checks and consumes one unit for `key`
    async fn allow(&self, key: &str) -> Result<RateLimitStatus> {
        self.allow_n(key, 1).await
    }

    /// Checks and consumes `n` units for `key` in one step
    async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitStatus>;

    /// Reports the current state for `key` without consuming anything
    async fn status(&self, key: &str) -> Result<RateLimitStatus>;

    /// Forgets everything about `key`
    async fn reset(&self, key: &str) -> Result<()>;
}

/// Rejects the arguments every limiter operation refuses before touching storage
pub(crate) fn validate_call(key: &str, n: u64) -> Result<()> {
    if key.is_empty() {
        return Err(RateLimiterError::KeyRequired);
    }
    if n == 0 {
        return Err(RateLimiterError::InvalidLimit(
            "request cost must be positive".to_string(),
        ));
    }
    Ok(())
}

/// `now + duration`, saturating instead of panicking on absurd durations
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Builds the limiter described by `config` on top of `store`
pub fn build_limiter<S>(config: &AlgorithmConfig, store: Arc<S>) -> Result<Arc<dyn Limiter>>
where
    S: WindowedStore + ?Sized + 'static,
{
    Ok(match config {
        AlgorithmConfig::TokenBucket(config) => {
            Arc::new(TokenBucket::new(store, config.clone())?)
        }
        AlgorithmConfig::SlidingWindow(config) => {
            Arc::new(SlidingWindow::new(store, config.clone())?)
        }
    })
}
