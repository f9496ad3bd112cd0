// for error definitions
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// A limiter was built without a backing store
    #[error("A backing store is required")]
    StoreRequired,

    /// Non-positive rate, limit or request cost
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    /// Non-positive (or unrepresentable) interval or window
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// Empty key passed to a limiter operation
    #[error("A rate limit key is required")]
    KeyRequired,

    /// Returned when a rate limit has been exceeded
    #[error("Rate limit exceeded: {0}")]
    LimitExceeded(String),

    /// Errors related to the storage backend
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RateLimiterError {
    /// True when the error came from the backing store rather than the caller.
    pub fn is_storage(&self) -> bool {
        matches!(self, RateLimiterError::Storage(_))
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Redis connection errors
    #[error("Redis connection error: {0}")]
    RedisConnection(String),

    // Redis authentication errors
    #[error("Redis authentication error: {0}")]
    RedisAuth(String),

    /// Redis command errors
    #[error("Redis command error: {0}")]
    RedisCommand(String),

    /// Data serialization/deserialization errors
    #[error("Data serialization error: {0}")]
    Serialization(String),

    /// The store cannot serve requests at all
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

// Implement conversions from redis::RedisError to StorageError
impl From<redis::RedisError> for RateLimiterError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::AuthenticationFailed => {
                RateLimiterError::Storage(StorageError::RedisAuth(err.to_string()))
            }
            redis::ErrorKind::IoError | redis::ErrorKind::ClientError => {
                RateLimiterError::Storage(StorageError::RedisConnection(err.to_string()))
            }
            redis::ErrorKind::TypeError => {
                RateLimiterError::Storage(StorageError::Serialization(err.to_string()))
            }
            _ => RateLimiterError::Storage(StorageError::RedisCommand(err.to_string())),
        }
    }
}

// config files are the only JSON this crate parses
impl From<serde_json::Error> for RateLimiterError {
    fn from(err: serde_json::Error) -> Self {
        RateLimiterError::Config(err.to_string())
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, RateLimiterError>;
