use std::sync::Arc;
use std::time::Duration;

use crate::cache::QueueActivityCache;
use crate::tests::{queued_job, store};

#[tokio::test]
async fn test_thousand_probes_share_one_refresh() {
    let store = store();
    store.insert_job(queued_job("orders", "doc-1", 0, 1.0, 0));
    let cache = Arc::new(QueueActivityCache::new(Duration::from_secs(5)));

    let probes = (0..1000).map(|_| {
        let cache = cache.clone();
        let store = store.clone();
        async move {
            cache
                .has_queued_jobs(store.as_ref(), "orders")
                .await
                .unwrap()
        }
    });
    let answers = futures::future::join_all(probes).await;

    assert!(answers.iter().all(|&hit| hit));
    assert_eq!(store.eligibility_queries(), 1);
}

#[tokio::test]
async fn test_membership_is_stale_until_invalidated() {
    let store = store();
    let cache = QueueActivityCache::new(Duration::from_secs(60));

    assert!(!cache
        .has_queued_jobs(store.as_ref(), "orders")
        .await
        .unwrap());
    assert_eq!(store.eligibility_queries(), 1);

    store.insert_job(queued_job("orders", "doc-1", 0, 1.0, 0));
    // inside the window the cache still answers from the last refresh
    assert!(!cache
        .has_queued_jobs(store.as_ref(), "orders")
        .await
        .unwrap());
    assert_eq!(store.eligibility_queries(), 1);

    cache.invalidate().await;
    assert!(cache
        .has_queued_jobs(store.as_ref(), "orders")
        .await
        .unwrap());
    assert_eq!(store.eligibility_queries(), 2);
}

#[tokio::test]
async fn test_window_expiry_triggers_refresh() {
    let store = store();
    store.insert_job(queued_job("orders", "doc-1", 0, 1.0, 0));
    let cache = QueueActivityCache::new(Duration::from_millis(10));

    assert!(cache
        .has_queued_jobs(store.as_ref(), "orders")
        .await
        .unwrap());
    assert_eq!(store.eligibility_queries(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(cache
        .has_queued_jobs(store.as_ref(), "orders")
        .await
        .unwrap());
    assert_eq!(store.eligibility_queries(), 2);
}
