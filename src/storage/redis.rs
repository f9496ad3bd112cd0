// src/storage/redis.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, Client, Script};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::{Store, TokenConsumption, WindowedStore};
use crate::storage_op;

// Token counters are hashes {c = count, e = expiry in server ms}. The Redis key
// itself outlives `e` by one window so an expired counter can still be told
// apart from one that never existed.
const SERVER_NOW: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
"#;

const GET_BODY: &str = r#"
local v = redis.call('HMGET', KEYS[1], 'c', 'e')
if not v[1] then return {0, 0} end
local e = tonumber(v[2])
if e <= now then return {0, 0} end
return {tonumber(v[1]), e - now}
"#;

const INCREMENT_BODY: &str = r#"
local delta = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local v = redis.call('HMGET', KEYS[1], 'c', 'e')
if (not v[1]) or tonumber(v[2]) <= now then
  redis.call('HSET', KEYS[1], 'c', delta, 'e', now + window)
  redis.call('PEXPIRE', KEYS[1], window * 2)
  return {delta, window}
end
local c = redis.call('HINCRBY', KEYS[1], 'c', delta)
return {c, tonumber(v[2]) - now}
"#;

const CONSUME_BODY: &str = r#"
local n = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local v = redis.call('HMGET', KEYS[1], 'c', 'e')
if not v[1] then
  if n > burst then return {0, burst, 0} end
  redis.call('HSET', KEYS[1], 'c', burst - n, 'e', now + window)
  redis.call('PEXPIRE', KEYS[1], window * 2)
  return {1, burst - n, window}
end
local c = tonumber(v[1])
local e = tonumber(v[2])
if e <= now then
  c = 0
  e = now + window
  redis.call('HSET', KEYS[1], 'c', 0, 'e', e)
  redis.call('PEXPIRE', KEYS[1], window * 2)
end
if c >= n then
  c = redis.call('HINCRBY', KEYS[1], 'c', -n)
  return {1, c, e - now}
end
return {0, c, e - now}
"#;

// Windows are sorted sets scored by millisecond timestamp
const RECORD_IF_ALLOWED: &str = r#"
local ts = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local n = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ts - window)
local count = redis.call('ZCARD', KEYS[1])
if count + n > limit then return {0, count} end
for i = 1, n do
  redis.call('ZADD', KEYS[1], ts, ARGV[5] .. ':' .. i)
end
redis.call('PEXPIRE', KEYS[1], window)
return {1, count + n}
"#;

/// Redis-backed store shared by any number of limiter processes.
///
/// The check-and-act operations run as Lua scripts, so they are atomic per
/// key across every client of the same Redis server.
pub struct RedisStorage {
    connection: ConnectionManager,
    config: RedisConfig,
    get_script: Script,
    increment_script: Script,
    consume_script: Script,
    record_script: Script,
}

// Scripts and the connection manager are noise in debug output
impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("url", &self.config.url)
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

impl RedisStorage {
    /// Connects to Redis, failing if no connection is made within
    /// `connection_timeout`
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| RateLimiterError::Storage(StorageError::RedisConnection(e.to_string())))?;

        let connection =
            match tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(RateLimiterError::Storage(StorageError::RedisConnection(
                        format!(
                            "Connection to Redis at {} timed out after {:?}",
                            config.url, config.connection_timeout
                        ),
                    )));
                }
            };

        Ok(Self {
            connection,
            get_script: Script::new(&format!("{}{}", SERVER_NOW, GET_BODY)),
            increment_script: Script::new(&format!("{}{}", SERVER_NOW, INCREMENT_BODY)),
            consume_script: Script::new(&format!("{}{}", SERVER_NOW, CONSUME_BODY)),
            record_script: Script::new(RECORD_IF_ALLOWED),
            config,
        })
    }

    /// Ping Redis to check health
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(RateLimiterError::Storage(StorageError::RedisCommand(
                format!("Unexpected response from Redis PING: {}", reply),
            )))
        }
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("{}:tb:{}", self.config.key_prefix, key)
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}:sw:{}", self.config.key_prefix, key)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

fn reply_field(reply: &[i64], index: usize) -> Result<i64> {
    reply.get(index).copied().ok_or_else(|| {
        RateLimiterError::Storage(StorageError::Serialization(format!(
            "script reply too short: {:?}",
            reply
        )))
    })
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[async_trait]
impl Store for RedisStorage {
    async fn get(&self, key: &str) -> Result<(i64, Duration)> {
        let start = Instant::now();
        let mut conn = self.connection.clone();
        let result: Result<Vec<i64>> = self
            .get_script
            .key(self.bucket_key(key))
            .invoke_async(&mut conn)
            .await
            .map_err(Into::into);
        storage_op!("get", key, result, elapsed_ms(start));

        let reply = result?;
        Ok((reply_field(&reply, 0)?, from_millis(reply_field(&reply, 1)?)))
    }

    async fn increment_and_get(
        &self,
        key: &str,
        delta: i64,
        window: Duration,
    ) -> Result<(i64, Duration)> {
        let start = Instant::now();
        let mut conn = self.connection.clone();
        let result: Result<Vec<i64>> = self
            .increment_script
            .key(self.bucket_key(key))
            .arg(delta)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await
            .map_err(Into::into);
        storage_op!("increment_and_get", key, result, elapsed_ms(start));

        let reply = result?;
        Ok((reply_field(&reply, 0)?, from_millis(reply_field(&reply, 1)?)))
    }

    async fn consume_tokens(
        &self,
        key: &str,
        n: i64,
        burst: i64,
        window: Duration,
    ) -> Result<TokenConsumption> {
        let start = Instant::now();
        let mut conn = self.connection.clone();
        let result: Result<Vec<i64>> = self
            .consume_script
            .key(self.bucket_key(key))
            .arg(n)
            .arg(burst)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await
            .map_err(Into::into);
        storage_op!("consume_tokens", key, result, elapsed_ms(start));

        let reply = result?;
        Ok(TokenConsumption {
            allowed: reply_field(&reply, 0)? == 1,
            remaining: reply_field(&reply, 1)?,
            ttl: from_millis(reply_field(&reply, 2)?),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        let mut conn = self.connection.clone();
        let removed: redis::RedisResult<i64> = redis::cmd("DEL")
            .arg(self.bucket_key(key))
            .arg(self.window_key(key))
            .query_async(&mut conn)
            .await;
        let result: Result<()> = removed.map(|_| ()).map_err(Into::into);
        storage_op!("delete", key, result, elapsed_ms(start));
        result
    }
}

#[async_trait]
impl WindowedStore for RedisStorage {
    async fn record_timestamp(
        &self,
        key: &str,
        ts: DateTime<Utc>,
        window: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        let window_key = self.window_key(key);
        let ts_ms = ts.timestamp_millis();
        let member = format!("{}:{}", ts_ms, Uuid::new_v4());
        let mut conn = self.connection.clone();

        let result: Result<()> = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&window_key)
            .arg("-inf")
            .arg(ts_ms - millis(window))
            .ignore()
            .cmd("ZADD")
            .arg(&window_key)
            .arg(ts_ms)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&window_key)
            .arg(millis(window))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(Into::into);
        storage_op!("record_timestamp", key, result, elapsed_ms(start));
        result
    }

    async fn count_in_window(&self, key: &str, window: Duration) -> Result<u64> {
        let start = Instant::now();
        let window_key = self.window_key(key);
        let cutoff = Utc::now().timestamp_millis() - millis(window);
        let mut conn = self.connection.clone();

        let result: Result<(u64,)> = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&window_key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZCARD")
            .arg(&window_key)
            .query_async(&mut conn)
            .await
            .map_err(Into::into);
        storage_op!("count_in_window", key, result, elapsed_ms(start));
        result.map(|(count,)| count)
    }

    async fn record_timestamp_if_allowed(
        &self,
        key: &str,
        ts: DateTime<Utc>,
        window: Duration,
        limit: u64,
        n: u64,
    ) -> Result<(bool, u64)> {
        let start = Instant::now();
        let ts_ms = ts.timestamp_millis();
        let mut conn = self.connection.clone();

        let result: Result<Vec<i64>> = self
            .record_script
            .key(self.window_key(key))
            .arg(ts_ms)
            .arg(millis(window))
            .arg(limit)
            .arg(n)
            .arg(format!("{}:{}", ts_ms, Uuid::new_v4()))
            .invoke_async(&mut conn)
            .await
            .map_err(Into::into);
        storage_op!("record_timestamp_if_allowed", key, result, elapsed_ms(start));

        let reply = result?;
        Ok((
            reply_field(&reply, 0)? == 1,
            reply_field(&reply, 1)?.max(0) as u64,
        ))
    }

    // Redis drops a sorted set as soon as its last member is removed
    async fn cleanup_expired(&self, key: &str, window: Duration) -> Result<()> {
        let cutoff = Utc::now().timestamp_millis() - millis(window);
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.window_key(key))
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
