// src/algorithms/tests/mod.rs



/// Behaviour shared by every limiter
#[cfg(test)]
mod common_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::algorithms::{build_limiter, Limiter, RateLimitStatus};
    use crate::config::{AlgorithmConfig, SlidingWindowConfig, TokenBucketConfig};
    use crate::error::RateLimiterError;
    use crate::test_utils::memory_store;

    fn limiters() -> Vec<(&'static str, Arc<dyn Limiter>)> {
        let token_bucket = AlgorithmConfig::TokenBucket(TokenBucketConfig {
            rate: 5,
            interval: Duration::from_secs(60),
            burst: None,
        });
        let sliding_window = AlgorithmConfig::SlidingWindow(SlidingWindowConfig {
            limit: 5,
            window: Duration::from_secs(60),
        });

        vec![
            ("token_bucket", build_limiter(&token_bucket, memory_store()).unwrap()),
            ("sliding_window", build_limiter(&sliding_window, memory_store()).unwrap()),
        ]
    }

    /// Test consistent behavior across all algorithm implementations
    #[tokio::test]
    async fn test_algorithm_trait_consistency() {
        for (name, limiter) in limiters() {
            for i in 0..5 {
                let result = limiter.allow(name).await.unwrap();
                assert!(result.allowed, "{}: Request {} should be allowed", name, i);
                assert_eq!(result.limit, 5);
            }

            let result = limiter.allow(name).await.unwrap();
            assert!(!result.allowed, "{}: 6th request should be denied", name);
            assert!(result.retry_after() > chrono::TimeDelta::zero());

            let other = limiter.allow(&format!("{}_other", name)).await.unwrap();
            assert!(other.allowed, "{}: Different key should be allowed", name);

            limiter.reset(name).await.unwrap();
            let after_reset = limiter.allow(name).await.unwrap();
            assert!(after_reset.allowed, "{}: allowed after reset", name);
            assert_eq!(after_reset.remaining, 4, "{}: full capacity after reset", name);
        }
    }

    #[tokio::test]
    async fn test_invalid_calls_are_rejected() {
        for (name, limiter) in limiters() {
            assert!(
                matches!(limiter.allow("").await, Err(RateLimiterError::KeyRequired)),
                "{}: empty key",
                name
            );
            assert!(matches!(
                limiter.status("").await,
                Err(RateLimiterError::KeyRequired)
            ));
            assert!(matches!(
                limiter.reset("").await,
                Err(RateLimiterError::KeyRequired)
            ));
            assert!(
                matches!(
                    limiter.allow_n(name, 0).await,
                    Err(RateLimiterError::InvalidLimit(_))
                ),
                "{}: zero cost is not coerced to one",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_status_does_not_consume() {
        for (name, limiter) in limiters() {
            for _ in 0..10 {
                let status = limiter.status(name).await.unwrap();
                assert!(status.allowed, "{}: status must not consume", name);
                assert_eq!(status.remaining, 5, "{}", name);
            }

            limiter.allow_n(name, 5).await.unwrap();
            let status = limiter.status(name).await.unwrap();
            assert!(!status.allowed, "{}: exhausted", name);
            assert_eq!(status.remaining, 0, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_allow_n_is_all_or_nothing() {
        for (name, limiter) in limiters() {
            let result = limiter.allow_n(name, 6).await.unwrap();
            assert!(!result.allowed, "{}: cost above capacity", name);

            let result = limiter.allow_n(name, 3).await.unwrap();
            assert!(result.allowed, "{}", name);
            assert_eq!(result.remaining, 2, "{}", name);

            let result = limiter.allow_n(name, 3).await.unwrap();
            assert!(!result.allowed, "{}: only 2 left", name);
            assert_eq!(result.remaining, 2, "{}: denial consumes nothing", name);
        }
    }

    #[test]
    fn test_into_result() {
        let denied = RateLimitStatus {
            allowed: false,
            limit: 3,
            remaining: 0,
            reset_at: chrono::Utc::now(),
        };
        assert!(matches!(
            denied.clone().into_result(),
            Err(RateLimiterError::LimitExceeded(_))
        ));

        let allowed = RateLimitStatus {
            allowed: true,
            ..denied
        };
        assert_eq!(allowed.retry_after(), chrono::TimeDelta::zero());
        assert!(allowed.into_result().is_ok());
    }
}
