// src/algorithms/sliding_window.rs

use crate::algorithms::{after, validate_call, Limiter, RateLimitStatus};
use crate::config::SlidingWindowConfig;
use crate::error::{RateLimiterError, Result};
use crate::rate_limit_event;
use crate::storage::WindowedStore;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Sliding Window rate limiting algorithm
///
/// Counts requests whose timestamps are strictly newer than `now - window`.
/// Exact, at the cost of storing one timestamp per admitted request.
#[derive(Debug)]
pub struct SlidingWindow<S>
where
    S: WindowedStore + ?Sized,
{
    store: Arc<S>,
    limit: u64,
    window: Duration,
}

impl<S> SlidingWindow<S>
where
    S: WindowedStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: SlidingWindowConfig) -> Result<Self> {
        if config.limit == 0 {
            return Err(RateLimiterError::InvalidLimit(
                "sliding window limit must be positive".to_string(),
            ));
        }
        if config.window.is_zero() {
            return Err(RateLimiterError::InvalidInterval(
                "sliding window duration must be positive".to_string(),
            ));
        }
        // Timestamps are chrono values, so the window has to fit in a TimeDelta
        if TimeDelta::from_std(config.window).is_err() {
            return Err(RateLimiterError::InvalidInterval(format!(
                "window {:?} is out of range",
                config.window
            )));
        }

        Ok(Self {
            store,
            limit: config.limit,
            window: config.window,
        })
    }

    pub fn builder() -> SlidingWindowBuilder<S> {
        SlidingWindowBuilder::default()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    // reset_at is a flat `now + window`; the real reset is when the oldest
    // entry ages out, which can be sooner
    fn status_from(&self, allowed: bool, count: u64) -> RateLimitStatus {
        RateLimitStatus {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(count),
            reset_at: after(Utc::now(), self.window),
        }
    }
}

#[async_trait]
impl<S> Limiter for SlidingWindow<S>
where
    S: WindowedStore + ?Sized,
{
    async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitStatus> {
        validate_call(key, n)?;

        let (allowed, count) = self
            .store
            .record_timestamp_if_allowed(key, Utc::now(), self.window, self.limit, n)
            .await?;

        let status = self.status_from(allowed, count);
        rate_limit_event!("sliding_window", key, status);
        Ok(status)
    }

    async fn status(&self, key: &str) -> Result<RateLimitStatus> {
        validate_call(key, 1)?;
        let count = self.store.count_in_window(key, self.window).await?;
        Ok(self.status_from(count < self.limit, count))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        validate_call(key, 1)?;
        self.store.delete(key).await
    }
}

/// Builder for [`SlidingWindow`]
pub struct SlidingWindowBuilder<S>
where
    S: WindowedStore + ?Sized,
{
    store: Option<Arc<S>>,
    limit: u64,
    window: Duration,
}

impl<S> Default for SlidingWindowBuilder<S>
where
    S: WindowedStore + ?Sized,
{
    fn default() -> Self {
        Self {
            store: None,
            limit: 0,
            window: Duration::ZERO,
        }
    }
}

impl<S> SlidingWindowBuilder<S>
where
    S: WindowedStore + ?Sized,
{
    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn build(self) -> Result<SlidingWindow<S>> {
        let store = self.store.ok_or(RateLimiterError::StoreRequired)?;
        SlidingWindow::new(
            store,
            SlidingWindowConfig {
                limit: self.limit,
                window: self.window,
            },
        )
    }
}
