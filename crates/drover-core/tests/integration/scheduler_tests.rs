use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use drover_core::{
    AppError, CacheConfig, JobScheduler, PoolConfig, ResourcePool, RetryPolicy, RunOutcome,
    Schedule, SchedulerConfig, TaskOutput, TaskSpec, TieredCache,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{FakeBrowserFactory, init_tracing};

fn scheduler() -> JobScheduler {
    init_tracing();
    JobScheduler::new(SchedulerConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(200),
        chain_delay: Duration::from_secs(5),
    })
}

#[tokio::test(start_paused = true)]
async fn scrape_then_analyze_through_pool_and_cache() {
    let scheduler = scheduler();
    let factory = FakeBrowserFactory::new(Duration::from_millis(50));
    let pool = ResourcePool::new(factory.clone(), PoolConfig::default());
    let cache: TieredCache = TieredCache::new(&CacheConfig::default());
    let analyzed = Arc::new(AtomicU32::new(0));

    let (scrape_pool, scrape_cache) = (pool.clone(), cache.clone());
    scheduler
        .register_task(
            TaskSpec::new("scrape", move || {
                let (pool, cache) = (scrape_pool.clone(), scrape_cache.clone());
                async move {
                    let listings = cache
                        .get_or_compute(
                            "scrape",
                            "https://example.com/permits",
                            || {
                                pool.execute_scoped(|page| async move {
                                    Ok::<_, AppError>(json!([
                                        { "id": 1, "page": page.page },
                                        { "id": 2, "page": page.page },
                                    ]))
                                })
                            },
                            None,
                        )
                        .await?;
                    let items = listings.as_array().map_or(0, Vec::len);
                    Ok(TaskOutput::items(items))
                }
            })
            .schedule(Schedule::every(Duration::from_secs(15 * 60)))
            .then("analyze", None),
        )
        .unwrap();

    let (analyze_cache, counter) = (cache.clone(), Arc::clone(&analyzed));
    scheduler
        .register_task(TaskSpec::new("analyze", move || {
            let (cache, counter) = (analyze_cache.clone(), Arc::clone(&counter));
            async move {
                let listings: Option<Value> =
                    cache.get("scrape", "https://example.com/permits").await;
                let count = listings.as_ref().and_then(Value::as_array).map_or(0, Vec::len);
                counter.fetch_add(count as u32, Ordering::SeqCst);
                Ok(TaskOutput::items(count))
            }
        }))
        .unwrap();

    let outcome = scheduler.run_guarded("scrape").await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed(TaskOutput::items(2)));
    assert_eq!(analyzed.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(analyzed.load(Ordering::SeqCst), 2);

    // Second scrape is served from cache: no new browser, no new page.
    scheduler.run_guarded("scrape").await.unwrap();
    assert_eq!(factory.launched(), 1);
    assert_eq!(factory.open_pages(), 0);

    let status = scheduler.get_status();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].name, "analyze");
    assert_eq!(status[0].success_count, 1);
    assert_eq!(status[1].success_count, 2);
    assert_eq!(status[1].schedule.as_deref(), Some("every 900000ms"));
}

#[tokio::test(start_paused = true)]
async fn pool_timeouts_are_retried_then_recorded() {
    let scheduler = scheduler();
    let factory = FakeBrowserFactory::new(Duration::ZERO);
    let pool = ResourcePool::new(
        factory,
        PoolConfig {
            max_size: 1,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    );
    // Held for the whole test, so every attempt times out.
    let _hog = pool.acquire_default().await.unwrap();

    let task_pool = pool.clone();
    scheduler
        .register_task(
            TaskSpec::new("blocked", move || {
                let pool = task_pool.clone();
                async move { pool.execute(|_| async { Ok(TaskOutput::items(1)) }).await }
            })
            .retry(RetryPolicy::new(2, Duration::from_millis(50))),
        )
        .unwrap();

    let err = scheduler.run_guarded("blocked").await.unwrap_err();
    assert!(matches!(err.root(), AppError::PoolTimeout(_)));

    let record = scheduler.get_record("blocked").unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.failure_count, 1);
    assert!(!record.running);
    // 100ms + 50ms backoff + 100ms
    assert!((record.avg_duration_ms - 250.0).abs() < 1.0);
    assert_eq!(pool.stats().timeouts, 2);
}

#[tokio::test(start_paused = true)]
async fn cron_task_fires_on_schedule() {
    let scheduler = scheduler();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    scheduler
        .register(
            "digest",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(TaskOutput::empty()) }
            },
            "* * * * *".parse().unwrap(),
        )
        .unwrap();

    let cancel = CancellationToken::new();
    let handles = scheduler.start(cancel.clone());
    tokio::time::sleep(Duration::from_secs(121)).await;
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    // Cron delays come from the wall clock, so allow for the minute boundary.
    let fired = calls.load(Ordering::SeqCst);
    assert!((2..=3).contains(&fired), "fired {fired} times");
}
