// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{RateLimiterError, Result};

/// Environment variable naming a JSON config file for the gateway
pub const CONFIG_PATH_ENV: &str = "RATE_LIMITER_CONFIG";

/// Environment variable overriding the gateway bind address
pub const BIND_ADDR_ENV: &str = "RATE_LIMITER_ADDR";

/// Configuration for token bucket algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Tokens added per `interval`
    pub rate: u64,

    /// Refill period
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Bucket capacity; unset or smaller than `rate` means `rate`
    #[serde(default)]
    pub burst: Option<u64>,
}

impl TokenBucketConfig {
    /// Effective capacity after applying the `burst >= rate` rule
    pub fn effective_burst(&self) -> u64 {
        self.burst.unwrap_or(self.rate).max(self.rate)
    }
}

/// Configuration for sliding window algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Maximum number of requests allowed in the window
    pub limit: u64,

    /// Window duration
    #[serde(with = "duration_serde")]
    pub window: Duration,
}

/// Either algorithm, selected by a `type` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    TokenBucket(TokenBucketConfig),
    SlidingWindow(SlidingWindowConfig),
}

impl AlgorithmConfig {
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmConfig::TokenBucket(_) => "token_bucket",
            AlgorithmConfig::SlidingWindow(_) => "sliding_window",
        }
    }
}

/// Configuration for Redis storage backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Prefix for every key this store writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection timeout
    #[serde(default = "default_conn_timeout", with = "duration_serde")]
    pub connection_timeout: Duration,
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_conn_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Configuration for in-memory storage backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Whether to use a background task for expiration
    #[serde(default = "default_use_background_task")]
    pub use_background_task: bool,

    /// How often to run the background expiration task
    #[serde(default = "default_cleanup_interval", with = "duration_serde")]
    pub cleanup_interval: Duration,

    /// Initial capacity of each key's timestamp list
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
}

fn default_use_background_task() -> bool {
    true
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_window_capacity() -> usize {
    100
}

// serde defaults only apply on deserialize, so mirror them here
impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            use_background_task: default_use_background_task(),
            cleanup_interval: default_cleanup_interval(),
            window_capacity: default_window_capacity(),
        }
    }
}

/// Which store backs the limiters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory(InMemoryConfig),
    Redis(RedisConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(InMemoryConfig::default())
    }
}

/// How the gateway derives a key from a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySource {
    Ip,
    Path,
    Method,
    Header { name: String },
    Static { value: String },
    Composite { parts: Vec<KeySource> },
}

impl Default for KeySource {
    fn default() -> Self {
        KeySource::Ip
    }
}

/// A path with its own limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub path: String,
    pub algorithm: AlgorithmConfig,
    /// Falls back to the server-wide key source when unset
    #[serde(default)]
    pub key: Option<KeySource>,
}

/// Top-level configuration for the demo gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default = "default_limit")]
    pub default_limit: AlgorithmConfig,

    #[serde(default)]
    pub key: KeySource,

    #[serde(default)]
    pub endpoints: Vec<EndpointSettings>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_limit() -> AlgorithmConfig {
    AlgorithmConfig::TokenBucket(TokenBucketConfig {
        rate: 10,
        interval: Duration::from_secs(1),
        burst: Some(20),
    })
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            storage: StorageConfig::default(),
            default_limit: default_limit(),
            key: KeySource::default(),
            endpoints: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parse a config from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RateLimiterError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Load from `RATE_LIMITER_CONFIG` if set, defaults otherwise, then apply
    /// the `RATE_LIMITER_ADDR` override.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        if let Ok(addr) = std::env::var(BIND_ADDR_ENV) {
            config.bind_addr = addr;
        }
        Ok(config)
    }
}

// Helper module to serialize/deserialize Duration with serde
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
