// src/algorithms/token_bucket.rs

use crate::algorithms::{after, validate_call, Limiter, RateLimitStatus};
use crate::config::TokenBucketConfig;
use crate::error::{RateLimiterError, Result};
use crate::rate_limit_event;
use crate::storage::Store;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Token Bucket rate limiting algorithm
///
/// Each key holds up to `burst` tokens and gains `rate` tokens every
/// `interval`. A request costing `n` is admitted only if `n` tokens can be
/// taken atomically from the store.
///
/// The store is the source of truth for token counts. The last refill instant
/// per key is kept in process and only decides *when* to top the store up;
/// losing it makes the key behave like a cold start.
pub struct TokenBucket<S>
where
    S: Store + ?Sized,
{
    /// Storage backend holding the token counters
    store: Arc<S>,

    /// Tokens added per interval
    rate: u64,

    /// Refill period
    interval: Duration,

    /// Bucket capacity, never below `rate`
    burst: u64,

    /// Idle time after which a key's bucket is full again
    idle_after: Duration,

    /// Refill bookkeeping, per key
    clocks: Mutex<RefillClocks>,
}

/// Refill bookkeeping for one key
#[derive(Debug, Clone, Copy)]
struct RefillClock {
    /// Instant of the last whole-interval refill
    last: Instant,
    /// A consume has reached the store, so a missing counter means it lapsed
    seeded: bool,
}

#[derive(Debug)]
struct RefillClocks {
    entries: HashMap<String, RefillClock>,
    last_eviction: Instant,
}

/// What one refill step found for a key
#[derive(Debug, Clone, Copy)]
struct Refill {
    earned: i64,
    seeded: bool,
}

impl<S> fmt::Debug for TokenBucket<S>
where
    S: Store + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("store", &self.store)
            .field("rate", &self.rate)
            .field("interval", &self.interval)
            .field("burst", &self.burst)
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

impl<S> TokenBucket<S>
where
    S: Store + ?Sized,
{
    /// Creates a token bucket over `store`, validating the configuration
    pub fn new(store: Arc<S>, config: TokenBucketConfig) -> Result<Self> {
        if config.rate == 0 {
            return Err(RateLimiterError::InvalidLimit(
                "token bucket rate must be positive".to_string(),
            ));
        }
        if config.interval.is_zero() {
            return Err(RateLimiterError::InvalidInterval(
                "token bucket interval must be positive".to_string(),
            ));
        }
        if i64::try_from(config.effective_burst()).is_err() {
            return Err(RateLimiterError::InvalidLimit(format!(
                "burst {} is too large",
                config.effective_burst()
            )));
        }

        let burst = config.effective_burst();
        // Intervals to refill from empty, plus one for a counter created
        // late in the last interval to lapse
        let intervals_to_fill = burst.div_ceil(config.rate).saturating_add(1);
        let idle_after = config
            .interval
            .checked_mul(u32::try_from(intervals_to_fill).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX);

        Ok(Self {
            store,
            rate: config.rate,
            interval: config.interval,
            burst,
            idle_after,
            clocks: Mutex::new(RefillClocks {
                entries: HashMap::new(),
                last_eviction: Instant::now(),
            }),
        })
    }

    /// Starts a builder; `build` fails with `StoreRequired` if no store is set
    pub fn builder() -> TokenBucketBuilder<S> {
        TokenBucketBuilder::default()
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of keys with refill bookkeeping held in process
    pub fn tracked_keys(&self) -> usize {
        self.clocks.lock().entries.len()
    }

    /// Whole intervals elapsed since `since`
    fn whole_intervals(&self, since: Instant, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(since).as_nanos();
        let intervals = elapsed / self.interval.as_nanos();
        u32::try_from(intervals).unwrap_or(u32::MAX)
    }

    fn tokens_for(&self, intervals: u32) -> i64 {
        (intervals as i64).saturating_mul(self.rate as i64)
    }

    /// Advances the refill clock for `key` by whole intervals and returns how
    /// many tokens that earned. A key seen for the first time starts its clock
    /// at `now` and earns nothing.
    fn advance_refill_clock(&self, key: &str, now: Instant) -> Refill {
        let mut clocks = self.clocks.lock();
        if now.saturating_duration_since(clocks.last_eviction) >= self.idle_after {
            self.evict_idle(&mut clocks, now);
        }

        let clock = clocks.entries.entry(key.to_string()).or_insert(RefillClock {
            last: now,
            seeded: false,
        });

        let intervals = self.whole_intervals(clock.last, now);
        if intervals > 0 {
            // Step by whole intervals only so partial progress carries over
            clock.last += self.interval * intervals;
        }
        Refill {
            earned: self.tokens_for(intervals),
            seeded: clock.seeded,
        }
    }

    /// Forgets keys idle long enough that their bucket is full and their
    /// stored counter has lapsed; such a key comes back as a cold start.
    fn evict_idle(&self, clocks: &mut RefillClocks, now: Instant) {
        let before = clocks.entries.len();
        clocks
            .entries
            .retain(|_, clock| now.saturating_duration_since(clock.last) < self.idle_after);
        clocks.last_eviction = now;

        let evicted = before - clocks.entries.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle token bucket clocks");
        }
    }

    fn mark_seeded(&self, key: &str) {
        if let Some(clock) = self.clocks.lock().entries.get_mut(key) {
            clock.seeded = true;
        }
    }

    /// Tokens `key` would earn right now, without moving its clock
    fn pending_tokens(&self, key: &str, now: Instant) -> (bool, i64) {
        match self.clocks.lock().entries.get(key) {
            Some(clock) => (true, self.tokens_for(self.whole_intervals(clock.last, now))),
            None => (false, 0),
        }
    }

    /// Tops the stored counter up by whatever the elapsed intervals earned,
    /// never past `burst`
    async fn refill(&self, key: &str, now: Instant) -> Result<()> {
        let Refill { earned, seeded } = self.advance_refill_clock(key, now);
        // Until a consume lands, a missing counter is a brand-new key and
        // consume_tokens seeds it
        if !seeded {
            return Ok(());
        }

        let burst = self.burst as i64;
        let (current, ttl) = self.store.get(key).await?;
        if ttl.is_zero() {
            // The counter lapsed or was swept while the clock kept running.
            // Recreate it from what the clock earned so consume_tokens never
            // reseeds a full bucket.
            self.store
                .increment_and_get(key, earned.min(burst), self.interval)
                .await?;
            return Ok(());
        }

        let delta = current.saturating_add(earned).min(burst) - current;
        if delta > 0 {
            self.store
                .increment_and_get(key, delta, self.interval)
                .await?;
        }
        Ok(())
    }

    fn status_from(&self, allowed: bool, remaining: i64, ttl: Duration) -> RateLimitStatus {
        let horizon = if ttl.is_zero() { self.interval } else { ttl };
        RateLimitStatus {
            allowed,
            limit: self.burst,
            remaining: remaining.max(0) as u64,
            reset_at: after(Utc::now(), horizon),
        }
    }
}

#[async_trait]
impl<S> Limiter for TokenBucket<S>
where
    S: Store + ?Sized,
{
    async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitStatus> {
        validate_call(key, n)?;
        let cost = i64::try_from(n).map_err(|_| {
            RateLimiterError::InvalidLimit(format!("request cost {} is too large", n))
        })?;

        self.refill(key, Instant::now()).await?;

        let consumed = self
            .store
            .consume_tokens(key, cost, self.burst as i64, self.interval)
            .await?;
        self.mark_seeded(key);

        let status = self.status_from(consumed.allowed, consumed.remaining, consumed.ttl);
        rate_limit_event!("token_bucket", key, status);
        Ok(status)
    }

    async fn status(&self, key: &str) -> Result<RateLimitStatus> {
        validate_call(key, 1)?;

        let (tracked, pending) = self.pending_tokens(key, Instant::now());
        let (current, ttl) = self.store.get(key).await?;

        // Nothing stored and never seen here: the next call gets a full bucket
        let available = if ttl.is_zero() && !tracked {
            self.burst as i64
        } else {
            current.saturating_add(pending).min(self.burst as i64)
        };

        Ok(self.status_from(available > 0, available, ttl))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        validate_call(key, 1)?;
        self.clocks.lock().entries.remove(key);
        self.store.delete(key).await
    }
}

/// Builder for [`TokenBucket`]
pub struct TokenBucketBuilder<S>
where
    S: Store + ?Sized,
{
    store: Option<Arc<S>>,
    rate: u64,
    interval: Duration,
    burst: Option<u64>,
}

impl<S> Default for TokenBucketBuilder<S>
where
    S: Store + ?Sized,
{
    fn default() -> Self {
        Self {
            store: None,
            rate: 0,
            interval: Duration::ZERO,
            burst: None,
        }
    }
}

impl<S> TokenBucketBuilder<S>
where
    S: Store + ?Sized,
{
    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn build(self) -> Result<TokenBucket<S>> {
        let store = self.store.ok_or(RateLimiterError::StoreRequired)?;
        TokenBucket::new(
            store,
            TokenBucketConfig {
                rate: self.rate,
                interval: self.interval,
                burst: self.burst,
            },
        )
    }
}
