// src/test_utils.rs

use super::algorithms::{Limiter, RateLimitStatus};
use super::config::InMemoryConfig;
use super::error::{RateLimiterError, Result, StorageError};
use super::storage::{MemoryStorage, Store, TokenConsumption, WindowedStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory store without the background sweeper, so tests need no timer
pub fn memory_store() -> Arc<MemoryStorage> {
    Arc::new(
        MemoryStorage::new(InMemoryConfig {
            use_background_task: false,
            ..InMemoryConfig::default()
        })
        .unwrap(),
    )
}

fn unavailable() -> RateLimiterError {
    RateLimiterError::Storage(StorageError::Unavailable("store is down".to_string()))
}

/// Store whose every operation fails, standing in for an unreachable backend
#[derive(Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl Store for FailingStore {
    async fn get(&self, _key: &str) -> Result<(i64, Duration)> {
        Err(unavailable())
    }

    async fn increment_and_get(
        &self,
        _key: &str,
        _delta: i64,
        _window: Duration,
    ) -> Result<(i64, Duration)> {
        Err(unavailable())
    }

    async fn consume_tokens(
        &self,
        _key: &str,
        _n: i64,
        _burst: i64,
        _window: Duration,
    ) -> Result<TokenConsumption> {
        Err(unavailable())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(unavailable())
    }
}

#[async_trait]
impl WindowedStore for FailingStore {
    async fn record_timestamp(
        &self,
        _key: &str,
        _ts: DateTime<Utc>,
        _window: Duration,
    ) -> Result<()> {
        Err(unavailable())
    }

    async fn count_in_window(&self, _key: &str, _window: Duration) -> Result<u64> {
        Err(unavailable())
    }

    async fn record_timestamp_if_allowed(
        &self,
        _key: &str,
        _ts: DateTime<Utc>,
        _window: Duration,
        _limit: u64,
        _n: u64,
    ) -> Result<(bool, u64)> {
        Err(unavailable())
    }

    async fn cleanup_expired(&self, _key: &str, _window: Duration) -> Result<()> {
        Err(unavailable())
    }
}

/// Limiter that always errors
#[derive(Debug, Default)]
pub struct FailingLimiter;

#[async_trait]
impl Limiter for FailingLimiter {
    async fn allow_n(&self, _key: &str, _n: u64) -> Result<RateLimitStatus> {
        Err(unavailable())
    }

    async fn status(&self, _key: &str) -> Result<RateLimitStatus> {
        Err(unavailable())
    }

    async fn reset(&self, _key: &str) -> Result<()> {
        Err(unavailable())
    }
}

/// Limiter that always allows and counts how often it was asked
#[derive(Debug, Default)]
pub struct CountingLimiter {
    calls: AtomicUsize,
}

impl CountingLimiter {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Limiter for CountingLimiter {
    async fn allow_n(&self, _key: &str, _n: u64) -> Result<RateLimitStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RateLimitStatus {
            allowed: true,
            limit: 100,
            remaining: 99,
            reset_at: Utc::now(),
        })
    }

    async fn status(&self, key: &str) -> Result<RateLimitStatus> {
        self.allow_n(key, 1).await
    }

    async fn reset(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// Limiter that always denies with a fixed reset instant
#[derive(Debug)]
pub struct ExhaustedLimiter {
    pub reset_at: DateTime<Utc>,
}

#[async_trait]
impl Limiter for ExhaustedLimiter {
    async fn allow_n(&self, _key: &str, _n: u64) -> Result<RateLimitStatus> {
        Ok(RateLimitStatus {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: self.reset_at,
        })
    }

    async fn status(&self, key: &str) -> Result<RateLimitStatus> {
        self.allow_n(key, 1).await
    }

    async fn reset(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}
