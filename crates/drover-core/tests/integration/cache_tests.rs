use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use drover_core::{AppError, CacheConfig, RegionConfig, TieredCache};
use serde_json::{Value, json};

use crate::integration::common::init_tracing;

fn cache() -> TieredCache {
    init_tracing();
    TieredCache::new(&CacheConfig {
        regions: vec![
            RegionConfig::new("scrape", Duration::from_millis(1000)),
            RegionConfig::new("db", Duration::from_secs(300)),
        ],
        ..Default::default()
    })
}

async fn fetch_listing(cache: &TieredCache, calls: &AtomicUsize) -> Value {
    cache
        .get_or_compute(
            "scrape",
            "https://example.com/listings?page=1",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, AppError>(json!({ "fetch": n, "items": ["a", "b"] }))
            },
            None,
        )
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn value_is_recomputed_only_after_ttl() {
    let cache = cache();
    let calls = AtomicUsize::new(0);

    assert_eq!(fetch_listing(&cache, &calls).await["fetch"], 1);
    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(fetch_listing(&cache, &calls).await["fetch"], 1);
    tokio::time::advance(Duration::from_millis(1000)).await;
    assert_eq!(fetch_listing(&cache, &calls).await["fetch"], 2);

    let scrape = cache
        .stats()
        .into_iter()
        .find(|r| r.name == "scrape")
        .unwrap();
    assert_eq!((scrape.hits, scrape.misses), (1, 2));
}

#[tokio::test]
async fn regions_are_independent() {
    let cache = cache();
    cache.insert("scrape", "permits", json!(1), None).await;
    cache.insert("db", "permits", json!(2), None).await;

    assert_eq!(cache.invalidate("scrape", "perm").await, 1);
    assert_eq!(cache.get("db", "permits").await, Some(json!(2)));
    assert_eq!(cache.get("scrape", "permits").await, None);
}

#[tokio::test]
async fn invalidating_perm_keeps_other_keys() {
    let cache = cache();
    for key in ["permits:open", "permits:closed", "inspections:open"] {
        cache.insert("db", key, json!(key), None).await;
    }

    assert_eq!(cache.invalidate("db", "perm").await, 2);
    assert_eq!(
        cache.get("db", "inspections:open").await,
        Some(json!("inspections:open"))
    );
}

#[tokio::test]
async fn failed_producer_retries_from_scratch() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));

    for expect_ok in [false, true] {
        let calls = Arc::clone(&calls);
        let result = cache
            .get_or_compute(
                "db",
                "violations",
                || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(AppError::Producer("connection reset".into()))
                    } else {
                        Ok(json!([]))
                    }
                },
                None,
            )
            .await;
        assert_eq!(result.is_ok(), expect_ok);
    }

    // The empty result is now cached.
    let cached = cache
        .get_or_compute(
            "db",
            "violations",
            || async { Err::<Value, _>(AppError::Producer("should not run".into())) },
            None,
        )
        .await
        .unwrap();
    assert_eq!(cached, json!([]));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
