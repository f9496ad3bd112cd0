// src/storage/tests/mod.rs

mod memory_tests;

// Contract checks every store must pass
pub(crate) mod common {
    use std::time::Duration;
    use tokio::time;

    use crate::error::Result;
    use crate::storage::{Store, WindowedStore};

    pub async fn test_counter_operations<S: Store>(storage: &S, prefix: &str) -> Result<()> {
        let key = format!("{}_counter", prefix);
        let window = Duration::from_secs(60);

        // Unknown keys read as zero with no TTL
        assert_eq!(storage.get(&key).await?, (0, Duration::ZERO));

        let (count, ttl) = storage.increment_and_get(&key, 3, window).await?;
        assert_eq!(count, 3);
        assert!(ttl > Duration::ZERO && ttl <= window);

        let (count, _) = storage.increment_and_get(&key, -1, window).await?;
        assert_eq!(count, 2);

        let (count, ttl) = storage.get(&key).await?;
        assert_eq!(count, 2);
        assert!(ttl > Duration::ZERO);

        storage.delete(&key).await?;
        assert_eq!(storage.get(&key).await?, (0, Duration::ZERO));

        // Deleting twice is fine
        storage.delete(&key).await?;
        Ok(())
    }

    pub async fn test_consume_tokens<S: Store>(storage: &S, prefix: &str) -> Result<()> {
        let key = format!("{}_consume", prefix);
        let window = Duration::from_secs(60);

        // More than burst on a new key: denied and nothing stored
        let result = storage.consume_tokens(&key, 6, 5, window).await?;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 5);
        assert_eq!(storage.get(&key).await?.0, 0);

        // New key is seeded with burst and debited in one step
        let result = storage.consume_tokens(&key, 2, 5, window).await?;
        assert!(result.allowed);
        assert_eq!(result.remaining, 3);
        assert!(result.ttl > Duration::ZERO);

        let result = storage.consume_tokens(&key, 3, 5, window).await?;
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);

        let result = storage.consume_tokens(&key, 1, 5, window).await?;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);

        storage.delete(&key).await?;
        Ok(())
    }

    pub async fn test_expired_counter_restarts<S: Store>(
        storage: &S,
        prefix: &str,
        window: Duration,
    ) -> Result<()> {
        let key = format!("{}_expiry", prefix);

        storage.consume_tokens(&key, 1, 5, window).await?;
        time::sleep(window + window / 2).await;

        assert_eq!(storage.get(&key).await?, (0, Duration::ZERO));

        // Expired is not the same as absent: no burst seed
        let result = storage.consume_tokens(&key, 1, 5, window).await?;
        assert!(!result.allowed, "expired counter restarts empty");
        assert_eq!(result.remaining, 0);

        let (count, _) = storage.increment_and_get(&key, 2, window).await?;
        assert_eq!(count, 2);

        storage.delete(&key).await?;
        Ok(())
    }

    pub async fn test_window_operations<S: WindowedStore>(
        storage: &S,
        prefix: &str,
    ) -> Result<()> {
        let key = format!("{}_window", prefix);
        let window = Duration::from_millis(300);
        let now = chrono::Utc::now();

        assert_eq!(storage.count_in_window(&key, window).await?, 0);

        storage.record_timestamp(&key, now, window).await?;
        storage.record_timestamp(&key, now, window).await?;
        assert_eq!(storage.count_in_window(&key, window).await?, 2);

        let (allowed, count) = storage
            .record_timestamp_if_allowed(&key, chrono::Utc::now(), window, 4, 2)
            .await?;
        assert!(allowed);
        assert_eq!(count, 4);

        let (allowed, count) = storage
            .record_timestamp_if_allowed(&key, chrono::Utc::now(), window, 4, 1)
            .await?;
        assert!(!allowed);
        assert_eq!(count, 4, "denied calls record nothing");

        time::sleep(window + Duration::from_millis(100)).await;
        assert_eq!(storage.count_in_window(&key, window).await?, 0);

        storage.cleanup_expired(&key, window).await?;
        storage.delete(&key).await?;
        Ok(())
    }
}
