use std::time::Duration;

use drover_core::{AppError, Drover, DroverConfig, Schedule, TaskOutput, TaskSpec};
use serde_json::json;

use crate::integration::common::{FakeBrowserFactory, init_tracing};

const CONFIG: &str = r#"{
    "pool": { "max_size": 2, "min_idle": 1, "acquire_timeout": 2000, "idle_timeout": 60000, "reap_interval": 10000 },
    "cache": { "default_ttl": 60000, "regions": [ { "name": "scrape", "ttl": 1800000 } ] },
    "scheduler": { "max_attempts": 2, "base_delay": 100, "chain_delay": 1000 }
}"#;

#[tokio::test(start_paused = true)]
async fn full_lifecycle_from_json_config() {
    init_tracing();
    let config = DroverConfig::from_json_str(CONFIG).unwrap();
    let factory = FakeBrowserFactory::new(Duration::from_millis(10));
    let drover: Drover<FakeBrowserFactory> = Drover::init(config, factory.clone()).await.unwrap();
    assert_eq!(factory.launched(), 1);

    let (pool, cache) = (drover.pool().clone(), drover.cache().clone());
    drover
        .scheduler()
        .register_task(
            TaskSpec::new("scrape", move || {
                let (pool, cache) = (pool.clone(), cache.clone());
                async move {
                    let found = cache
                        .get_or_compute(
                            "scrape",
                            "feed",
                            || pool.execute_scoped(|_page| async { Ok::<_, AppError>(json!(3)) }),
                            None,
                        )
                        .await?;
                    Ok(TaskOutput::items(found.as_u64().unwrap_or(0) as usize))
                }
            })
            .schedule(Schedule::every(Duration::from_secs(30)))
            .then("persist", None),
        )
        .unwrap();
    drover
        .scheduler()
        .register_task(TaskSpec::new("persist", || async { Ok(TaskOutput::empty()) }))
        .unwrap();

    assert_eq!(drover.start_scheduler(), 1);
    tokio::time::sleep(Duration::from_secs(95)).await;

    let health = drover.health();
    let scrape = health.jobs.iter().find(|j| j.name == "scrape").unwrap();
    let persist = health.jobs.iter().find(|j| j.name == "persist").unwrap();
    assert_eq!(scrape.success_count, 3);
    assert_eq!(persist.success_count, 3);
    assert_eq!(health.pool.created, 1);
    let scrape_region = health.cache.iter().find(|r| r.name == "scrape").unwrap();
    assert_eq!((scrape_region.hits, scrape_region.misses), (2, 1));
    assert!(health.is_healthy());

    drover.shutdown().await;
    assert!(drover.pool().is_shutdown());
    assert!(matches!(
        drover.pool().acquire_default().await,
        Err(AppError::PoolShutdown)
    ));
}

#[tokio::test]
async fn invalid_json_config_is_rejected() {
    let err = DroverConfig::from_json_str(r#"{ "pool": { "max_size": 2, "min_idle": 5 } }"#)
        .unwrap_err();
    assert!(matches!(err, AppError::ConfigError(_)));
}
