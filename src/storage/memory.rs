// src/storage/memory.rs

// In-memory storage (for tests, single-process deployments and as the default)
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::config::InMemoryConfig;
use crate::error::{RateLimiterError, Result};
use crate::storage::{window_cutoff, Store, TokenConsumption, WindowedStore};

/// Token counter with its absolute expiry
#[derive(Debug, Clone, Copy)]
struct BucketEntry {
    count: i64,
    expires_at: Instant,
}

impl BucketEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Timestamps for one sliding-window key
#[derive(Debug)]
struct WindowEntry {
    timestamps: Vec<DateTime<Utc>>,
    /// Last window duration a caller used, so the sweeper knows the cutoff
    window: Duration,
}

impl WindowEntry {
    fn new(capacity: usize, window: Duration) -> Self {
        Self {
            timestamps: Vec::with_capacity(capacity),
            window,
        }
    }

    /// Drops everything at or before `now - window`
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        if let Some(cutoff) = window_cutoff(now, window) {
            self.timestamps.retain(|ts| *ts > cutoff);
        }
    }
}

#[derive(Debug)]
struct Inner {
    buckets: RwLock<HashMap<String, BucketEntry>>,
    // Map lock guards the shape; each entry has its own lock so hot keys
    // don't serialize behind one another. Writers to an entry hold the map
    // read lock for the duration so the sweeper cannot orphan the entry.
    windows: RwLock<HashMap<String, Mutex<WindowEntry>>>,
    window_capacity: usize,
}

impl Inner {
    /// Runs `f` on the window entry for `key`, creating it if needed
    fn with_window<R>(
        &self,
        key: &str,
        window: Duration,
        f: impl FnOnce(&mut WindowEntry) -> R,
    ) -> R {
        {
            let windows = self.windows.read();
            if let Some(entry) = windows.get(key) {
                let mut entry = entry.lock();
                entry.window = window;
                return f(&mut entry);
            }
        }

        let mut windows = self.windows.write();
        let entry = windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(WindowEntry::new(self.window_capacity, window)))
            .get_mut();
        entry.window = window;
        f(entry)
    }

    /// One cleanup pass. Returns `(buckets_removed, windows_removed)`.
    fn sweep(&self) -> (usize, usize) {
        let now = Instant::now();
        let buckets_removed = {
            let mut buckets = self.buckets.write();
            let before = buckets.len();
            buckets.retain(|_, entry| entry.is_live(now));
            before - buckets.len()
        };

        let wall_now = Utc::now();
        let windows_removed = {
            let mut windows = self.windows.write();
            let before = windows.len();
            windows.retain(|_, entry| {
                let entry = entry.get_mut();
                let window = entry.window;
                entry.prune(wall_now, window);
                !entry.timestamps.is_empty()
            });
            before - windows.len()
        };

        (buckets_removed, windows_removed)
    }
}

/// Stop signal and join handle of the sweeper task
#[derive(Debug)]
struct CleanupTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// In-memory storage backend implementation
///
/// Token counters and sliding windows live in separate maps. When
/// `use_background_task` is set, a sweeper removes expired counters and empty
/// windows every `cleanup_interval`; [`MemoryStorage::close`] stops it and
/// waits for it to finish. Creating a store with the sweeper enabled requires
/// a Tokio runtime.
#[derive(Debug)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl MemoryStorage {
    /// Creates a new in-memory storage with the given configuration
    ///
    /// Fails with `InvalidInterval` if the sweeper is enabled with a zero
    /// `cleanup_interval`.
    pub fn new(config: InMemoryConfig) -> Result<Self> {
        if config.use_background_task && config.cleanup_interval.is_zero() {
            return Err(RateLimiterError::InvalidInterval(
                "memory store cleanup interval must be positive".to_string(),
            ));
        }

        let inner = Arc::new(Inner {
            buckets: RwLock::new(HashMap::new()),
            windows: RwLock::new(HashMap::new()),
            window_capacity: config.window_capacity,
        });

        let cleanup = if config.use_background_task {
            Some(Self::spawn_cleanup(
                Arc::downgrade(&inner),
                config.cleanup_interval,
            ))
        } else {
            None
        };

        Ok(Self {
            inner,
            cleanup: Mutex::new(cleanup),
        })
    }

    fn spawn_cleanup(inner: Weak<Inner>, interval: Duration) -> CleanupTask {
        let (stop, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            debug!(?interval, "Memory store cleanup started");
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    // Fires on an explicit stop and when the sender is dropped
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        let (buckets, windows) = inner.sweep();
                        if buckets > 0 || windows > 0 {
                            debug!(buckets, windows, "Removed expired rate limit entries");
                        }
                    }
                }
            }

            debug!("Memory store cleanup stopped");
        });

        CleanupTask { stop, handle }
    }

    /// Runs one cleanup pass immediately
    pub fn purge_expired(&self) {
        self.inner.sweep();
    }

    /// Number of keys currently held, as `(token_counters, windows)`
    pub fn key_counts(&self) -> (usize, usize) {
        (
            self.inner.buckets.read().len(),
            self.inner.windows.read().len(),
        )
    }

    /// Whether the sweeper is still attached to this store
    pub fn has_cleanup_task(&self) -> bool {
        self.cleanup.lock().is_some()
    }
}

#[async_trait]
impl Store for MemoryStorage {
    async fn get(&self, key: &str) -> Result<(i64, Duration)> {
        let now = Instant::now();
        let buckets = self.inner.buckets.read();
        Ok(match buckets.get(key) {
            Some(entry) if entry.is_live(now) => (entry.count, entry.ttl(now)),
            _ => (0, Duration::ZERO),
        })
    }

    async fn increment_and_get(
        &self,
        key: &str,
        delta: i64,
        window: Duration,
    ) -> Result<(i64, Duration)> {
        let now = Instant::now();
        let mut buckets = self.inner.buckets.write();

        match buckets.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.count += delta;
                Ok((entry.count, entry.ttl(now)))
            }
            _ => {
                buckets.insert(
                    key.to_string(),
                    BucketEntry {
                        count: delta,
                        expires_at: now + window,
                    },
                );
                Ok((delta, window))
            }
        }
    }

    async fn consume_tokens(
        &self,
        key: &str,
        n: i64,
        burst: i64,
        window: Duration,
    ) -> Result<TokenConsumption> {
        let now = Instant::now();
        let mut buckets = self.inner.buckets.write();

        let entry = match buckets.get_mut(key) {
            Some(entry) => entry,
            None => {
                if n > burst {
                    return Ok(TokenConsumption {
                        allowed: false,
                        remaining: burst,
                        ttl: Duration::ZERO,
                    });
                }
                buckets.insert(
                    key.to_string(),
                    BucketEntry {
                        count: burst - n,
                        expires_at: now + window,
                    },
                );
                return Ok(TokenConsumption {
                    allowed: true,
                    remaining: burst - n,
                    ttl: window,
                });
            }
        };

        if !entry.is_live(now) {
            entry.count = 0;
            entry.expires_at = now + window;
        }

        let allowed = entry.count >= n;
        if allowed {
            entry.count -= n;
        }

        Ok(TokenConsumption {
            allowed,
            remaining: entry.count,
            ttl: entry.ttl(now),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.buckets.write().remove(key);
        self.inner.windows.write().remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let task = self.cleanup.lock().take();
        if let Some(CleanupTask { stop, handle }) = task {
            // The task may already be gone if the runtime is shutting down
            let _ = stop.send(());
            if let Err(e) = handle.await {
                warn!("Memory store cleanup task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WindowedStore for MemoryStorage {
    async fn record_timestamp(
        &self,
        key: &str,
        ts: DateTime<Utc>,
        window: Duration,
    ) -> Result<()> {
        self.inner.with_window(key, window, |entry| {
            entry.prune(ts, window);
            entry.timestamps.push(ts);
        });
        Ok(())
    }

    async fn count_in_window(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Utc::now();
        let windows = self.inner.windows.read();
        Ok(match windows.get(key) {
            Some(entry) => {
                let mut entry = entry.lock();
                entry.prune(now, window);
                entry.timestamps.len() as u64
            }
            None => 0,
        })
    }

    async fn record_timestamp_if_allowed(
        &self,
        key: &str,
        ts: DateTime<Utc>,
        window: Duration,
        limit: u64,
        n: u64,
    ) -> Result<(bool, u64)> {
        Ok(self.inner.with_window(key, window, |entry| {
            entry.prune(ts, window);
            let count = entry.timestamps.len() as u64;
            if count.saturating_add(n) > limit {
                return (false, count);
            }
            entry
                .timestamps
                .extend(std::iter::repeat(ts).take(n as usize));
            (true, count + n)
        }))
    }

    async fn cleanup_expired(&self, key: &str, window: Duration) -> Result<()> {
        let now = Utc::now();
        let mut windows = self.inner.windows.write();
        let empty = match windows.get_mut(key) {
            Some(entry) => {
                let entry = entry.get_mut();
                entry.prune(now, window);
                entry.timestamps.is_empty()
            }
            None => false,
        };
        if empty {
            windows.remove(key);
        }
        Ok(())
    }
}
