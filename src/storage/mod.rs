// src/storage/mod.rs

pub mod memory;
pub mod redis;

#[cfg(test)]
mod tests;

pub use memory::MemoryStorage;
pub use redis::RedisStorage;

use super::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt::Debug;
use std::time::Duration;

/// Outcome of an atomic check-and-consume on a token counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConsumption {
    /// Whether `n` tokens were debited
    pub allowed: bool,
    /// Counter value after the operation
    pub remaining: i64,
    /// Time left before the counter expires; zero when nothing is stored
    pub ttl: Duration,
}

/// Counter storage used by the token bucket.
///
/// Every method must be safe under arbitrary concurrent callers. Unknown or
/// expired keys are never an error.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Returns `(count, ttl)`, or `(0, 0)` for unknown or expired keys
    async fn get(&self, key: &str) -> Result<(i64, Duration)>;

    /// Adds `delta` (which may be negative) to a live counter and returns the
    /// new value with its remaining TTL. An absent or expired counter starts
    /// over at `delta` with a fresh `window`-long TTL.
    async fn increment_and_get(&self, key: &str, delta: i64, window: Duration)
        -> Result<(i64, Duration)>;

    /// Atomically debits `n` tokens if available.
    ///
    /// A brand-new key is seeded with `burst` and debited in the same step when
    /// `n <= burst`, and left untouched otherwise. An expired key is treated as
    /// empty: its count restarts at zero with a fresh TTL. Refill is the
    /// caller's job.
    async fn consume_tokens(
        &self,
        key: &str,
        n: i64,
        burst: i64,
        window: Duration,
    ) -> Result<TokenConsumption>;

    /// Removes every trace of `key`. Deleting an unknown key is fine.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Releases background resources. Must be idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Timestamp storage used by the sliding window.
#[async_trait]
pub trait WindowedStore: Store {
    /// Appends `ts` unconditionally, pruning entries at or before `ts - window`
    async fn record_timestamp(&self, key: &str, ts: DateTime<Utc>, window: Duration)
        -> Result<()>;

    /// Prunes expired entries and returns how many remain
    async fn count_in_window(&self, key: &str, window: Duration) -> Result<u64>;

    /// Atomically prunes, then records `n` copies of `ts` only if the window
    /// has room for all of them. Returns `(allowed, count)` where `count`
    /// includes the new entries when allowed.
    async fn record_timestamp_if_allowed(
        &self,
        key: &str,
        ts: DateTime<Utc>,
        window: Duration,
        limit: u64,
        n: u64,
    ) -> Result<(bool, u64)>;

    /// Prunes `key` and forgets it entirely once nothing is left
    async fn cleanup_expired(&self, key: &str, window: Duration) -> Result<()>;
}

/// Oldest timestamp that is still outside the window ending at `ts`.
///
/// `None` means the window reaches past the representable range and nothing
/// should be pruned.
pub(crate) fn window_cutoff(ts: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|window| ts.checked_sub_signed(window))
}
