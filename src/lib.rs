// library entry
pub mod algorithms;
pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod middleware;
pub mod storage;

#[cfg(test)]
mod test_utils;

// Re-export key components for convenience
pub use algorithms::{build_limiter, Limiter, RateLimitStatus, SlidingWindow, TokenBucket};
pub use error::{RateLimiterError, Result};
pub use logging::init as init_logging;
pub use middleware::{EndpointConfig, RateLimitLayer};
pub use storage::{MemoryStorage, Store, WindowedStore};
