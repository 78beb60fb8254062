use floodgate::{Cause, FailurePolicy, RateLimiter, SlidingWindow};
use floodgate_redis::RedisWindowStore;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// Requires Redis running. If FLOODGATE_TEST_REDIS_URL is unset, the tests skip.
async fn store() -> Option<RedisWindowStore> {
    let url = match std::env::var("FLOODGATE_TEST_REDIS_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set FLOODGATE_TEST_REDIS_URL (e.g. redis://127.0.0.1/)");
            return None;
        }
    };
    Some(RedisWindowStore::connect(&url).await.expect("failed to connect to Redis"))
}

fn unique_prefix() -> String {
    format!("floodgate:test:{}:", Uuid::new_v4())
}

#[tokio::test]
async fn admits_limit_per_window_then_recovers() {
    let Some(store) = store().await else { return };
    let limiter = SlidingWindow::new(store, 5, Duration::from_secs(1))
        .unwrap()
        .with_store_timeout(Duration::from_secs(2))
        .with_key_prefix(unique_prefix());

    for i in 0..5 {
        let d = limiter.check("ip:203.0.113.7").await;
        assert!(d.allowed, "call {i} should be admitted");
        assert_eq!(d.remaining, 4 - i);
    }
    let denied = limiter.check("ip:203.0.113.7").await;
    assert!(!denied.allowed);
    assert_eq!(denied.cause, Cause::QuotaExhausted);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(limiter.allow("ip:203.0.113.7").await);
}

#[tokio::test]
async fn reset_clears_the_key() {
    let Some(store) = store().await else { return };
    let limiter = SlidingWindow::new(store, 1, Duration::from_secs(60))
        .unwrap()
        .with_store_timeout(Duration::from_secs(2))
        .with_key_prefix(unique_prefix());

    assert!(limiter.allow("user:42").await);
    assert!(!limiter.allow("user:42").await);
    limiter.reset("user:42").await.unwrap();
    assert!(limiter.allow("user:42").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_admit_exactly_the_limit() {
    let Some(store) = store().await else { return };
    for _ in 0..10 {
        let limiter = Arc::new(
            SlidingWindow::new(store.clone(), 10, Duration::from_secs(30))
                .unwrap()
                .with_store_timeout(Duration::from_secs(5))
                .with_failure_policy(FailurePolicy::FailClosed)
                .with_key_prefix(unique_prefix()),
        );
        let handles: Vec<_> = (0..40)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("shared").await })
            })
            .collect();
        let decisions: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(decisions.iter().all(|d| !d.is_degraded()), "store must answer every call");
        assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 10);
    }
}
