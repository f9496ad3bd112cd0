#[cfg(test)]
mod tests {
    use chrono::Utc;
    use futures::future::join_all;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio::time;
    use tokio_test::assert_ok;

    use crate::config::InMemoryConfig;
    use crate::error::RateLimiterError;
    use crate::storage::{MemoryStorage, Store, WindowedStore};
    use crate::test_utils::memory_store;

    use super::super::common;

    // Helper function to create a MemoryStorage with a fast sweeper
    fn create_swept_memory(cleanup_interval: Duration) -> MemoryStorage {
        MemoryStorage::new(InMemoryConfig {
            use_background_task: true,
            cleanup_interval,
            window_capacity: 8,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_counter_operations() {
        let memory = memory_store();

        let result = time::timeout(
            Duration::from_secs(5),
            common::test_counter_operations(memory.as_ref(), "memory"),
        )
        .await;

        assert!(result.is_ok(), "Test timed out");
        assert!(result.unwrap().is_ok(), "Counter operations failed");
    }

    #[tokio::test]
    async fn test_memory_consume_tokens() {
        let memory = memory_store();
        common::test_consume_tokens(memory.as_ref(), "memory")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_memory_expired_counter() {
        let memory = memory_store();
        common::test_expired_counter_restarts(memory.as_ref(), "memory", Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_memory_window_operations() {
        let memory = memory_store();
        common::test_window_operations(memory.as_ref(), "memory")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_memory_background_cleanup() {
        let memory = create_swept_memory(Duration::from_millis(50));
        let window = Duration::from_millis(50);

        memory.increment_and_get("sweep_counter", 1, window).await.unwrap();
        memory
            .record_timestamp("sweep_window", Utc::now(), window)
            .await
            .unwrap();
        memory
            .increment_and_get("long_lived", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(memory.key_counts(), (2, 1));

        // Wait for expiration and at least one sweep, with a timeout
        let wait_result = time::timeout(Duration::from_secs(2), async {
            while memory.key_counts() != (1, 0) {
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        assert!(wait_result.is_ok(), "Sweeper did not remove expired keys");
        assert_eq!(memory.get("long_lived").await.unwrap().0, 1);

        memory.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_purge_expired_without_task() {
        let memory = memory_store();
        let window = Duration::from_millis(30);

        memory.increment_and_get("purge_me", 1, window).await.unwrap();
        memory
            .record_timestamp("purge_window", Utc::now(), window)
            .await
            .unwrap();
        time::sleep(Duration::from_millis(60)).await;

        assert_eq!(memory.key_counts(), (1, 1), "nothing removes keys on its own");
        memory.purge_expired();
        assert_eq!(memory.key_counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_memory_cleanup_expired_removes_empty_window() {
        let memory = memory_store();
        let window = Duration::from_millis(30);

        memory
            .record_timestamp("stale", Utc::now(), window)
            .await
            .unwrap();
        memory.cleanup_expired("stale", window).await.unwrap();
        assert_eq!(memory.key_counts().1, 1, "live entries are kept");

        time::sleep(Duration::from_millis(60)).await;
        memory.cleanup_expired("stale", window).await.unwrap();
        assert_eq!(memory.key_counts().1, 0);

        // Unknown keys are fine
        memory.cleanup_expired("never_seen", window).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_close_is_idempotent() {
        let memory = create_swept_memory(Duration::from_millis(10));
        assert!(memory.has_cleanup_task());

        let result = time::timeout(Duration::from_secs(1), memory.close()).await;
        assert!(result.is_ok(), "close must not hang");
        assert!(!memory.has_cleanup_task());

        memory.close().await.unwrap();

        // The store keeps working without its sweeper
        let (count, _) = memory
            .increment_and_get("after_close", 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_memory_rejects_zero_cleanup_interval() {
        let config: InMemoryConfig =
            serde_json::from_str(r#"{ "cleanup_interval": 0 }"#).unwrap();
        assert!(config.use_background_task);

        let result = MemoryStorage::new(config);
        assert!(matches!(result, Err(RateLimiterError::InvalidInterval(_))));

        // Without a sweeper the interval is never used
        let unswept = MemoryStorage::new(InMemoryConfig {
            use_background_task: false,
            cleanup_interval: Duration::ZERO,
            window_capacity: 8,
        });
        assert!(unswept.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_concurrent_consume() {
        let memory = memory_store();
        let tasks = 16;
        let barrier = Arc::new(Barrier::new(tasks));

        let handles = (0..tasks).map(|_| {
            let memory = Arc::clone(&memory);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                let mut granted = 0;
                for _ in 0..10 {
                    let result = memory
                        .consume_tokens("race", 1, 50, Duration::from_secs(60))
                        .await
                        .unwrap();
                    if result.allowed {
                        granted += 1;
                    }
                }
                granted
            })
        });

        let wait_result = time::timeout(Duration::from_secs(5), join_all(handles)).await;
        assert!(wait_result.is_ok(), "Tasks timed out");

        let granted: usize = wait_result
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .sum();
        assert_eq!(granted, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_concurrent_record_if_allowed() {
        let memory = memory_store();
        let tasks = 12;
        let barrier = Arc::new(Barrier::new(tasks));
        let window = Duration::from_secs(60);

        let handles = (0..tasks).map(|i| {
            let memory = Arc::clone(&memory);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                let mut granted = 0;
                for _ in 0..10 {
                    // Mix of single and double costs
                    let n = if i % 2 == 0 { 1 } else { 2 };
                    let (allowed, count) = memory
                        .record_timestamp_if_allowed("window_race", Utc::now(), window, 40, n)
                        .await
                        .unwrap();
                    assert!(count <= 40, "count never passes the limit");
                    if allowed {
                        granted += n;
                    }
                }
                granted
            })
        });

        let granted: u64 = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();

        assert!(granted <= 40);
        assert_eq!(
            memory.count_in_window("window_race", window).await.unwrap(),
            granted
        );
    }

    // No sweeper, so a bare current-thread runtime is enough
    #[test]
    fn test_memory_keys_are_independent() {
        let memory = memory_store();
        let window = Duration::from_secs(60);

        tokio_test::block_on(async {
            assert_ok!(memory.consume_tokens("a", 5, 5, window).await);
            let result = assert_ok!(memory.consume_tokens("b", 1, 5, window).await);

            assert!(result.allowed);
            assert_eq!(result.remaining, 4);

            // Counters and windows share a key space only through delete
            assert_ok!(memory.record_timestamp("a", Utc::now(), window).await);
            assert_ok!(memory.delete("a").await);
        });

        assert_eq!(memory.key_counts(), (1, 0));
    }
}
