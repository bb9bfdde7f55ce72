use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use drover_core::{AppError, PoolConfig, ResourcePool, UnitProfile};
use futures::future::join_all;
use tokio::time::Instant;

use crate::integration::common::{FakeBrowserFactory, init_tracing};

fn pool(max_size: usize, launch_delay: Duration) -> (ResourcePool<FakeBrowserFactory>, FakeBrowserFactory) {
    init_tracing();
    let factory = FakeBrowserFactory::new(launch_delay);
    let pool = ResourcePool::new(
        factory.clone(),
        PoolConfig {
            max_size,
            acquire_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    );
    (pool, factory)
}

#[tokio::test(start_paused = true)]
async fn three_jobs_on_two_browsers_take_two_rounds() {
    let (pool, factory) = pool(2, Duration::ZERO);
    let started = Instant::now();

    let jobs = (0..3).map(|i| {
        let pool = pool.clone();
        async move {
            pool.execute(|browser| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, AppError>((i, browser.id))
            })
            .await
        }
    });
    let results = join_all(jobs).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(started.elapsed(), Duration::from_millis(200));
    assert_eq!(factory.launched(), 2);
    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.handoffs, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_max_size() {
    let (pool, _factory) = pool(3, Duration::from_millis(20));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let jobs = (0..12).map(|i| {
        let pool = pool.clone();
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        async move {
            pool.execute(|_browser| async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 * (i % 4 + 1))).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await
        }
    });
    for result in join_all(jobs).await {
        result.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert!(pool.stats().total <= 3);
}

#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_arrival_order() {
    let (pool, _factory) = pool(1, Duration::ZERO);
    let holder = pool.acquire_default().await.unwrap();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut waiters = Vec::new();
    for name in ["w1", "w2", "w3"] {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
            order.lock().unwrap().push(name);
            tokio::time::sleep(Duration::from_millis(10)).await;
            pool.release(lease);
        }));
        // Let each waiter enqueue before the next one is spawned.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(pool.stats().queue_length, 3);

    pool.release(holder);
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["w1", "w2", "w3"]);
}

#[tokio::test(start_paused = true)]
async fn timed_out_acquire_leaves_queue_unchanged() {
    let (pool, _factory) = pool(1, Duration::ZERO);
    let holder = pool.acquire_default().await.unwrap();

    let patient = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(10)).await.map(|l| l.id()) })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(pool.stats().queue_length, 1);

    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, AppError::PoolTimeout(d) if d == Duration::from_millis(50)));
    assert_eq!(pool.stats().queue_length, 1);
    assert_eq!(pool.stats().timeouts, 1);

    let id = holder.id();
    pool.release(holder);
    assert_eq!(patient.await.unwrap().unwrap(), id);
}

#[tokio::test(start_paused = true)]
async fn crashed_browser_is_replaced_for_waiter() {
    let (pool, factory) = pool(1, Duration::from_millis(5));
    let lease = pool.acquire_default().await.unwrap();
    let dead = lease.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|l| l.id()) })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    factory.crash(dead);
    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.disconnects, 1);

    // The crashed browser's lease still comes back, but is not reused.
    pool.release(lease);
    let replacement = waiter.await.unwrap().unwrap();
    assert_ne!(replacement, dead);
    assert_eq!(factory.launched(), 2);

    tokio::task::yield_now().await;
    assert!(factory.closed().contains(&dead));
    assert_eq!(pool.stats().active, 0);
}

#[tokio::test]
async fn scoped_pages_close_even_on_error() {
    let (pool, factory) = pool(2, Duration::ZERO);

    let ua = pool
        .execute_scoped(|page| async move { Ok::<_, AppError>(page.user_agent) })
        .await
        .unwrap();
    assert_eq!(ua, UnitProfile::default().user_agent);

    let err = pool
        .execute_scoped(|page| async move {
            assert_eq!(page.page, 2);
            Err::<(), _>(AppError::Operation("selector not found".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Operation(_)));

    assert_eq!(factory.open_pages(), 0);
    assert_eq!(pool.stats().active, 0);
}

#[tokio::test]
async fn shutdown_rejects_new_and_queued_acquires() {
    let (pool, factory) = pool(1, Duration::ZERO);
    let lease = pool.acquire_default().await.unwrap();

    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(30)).await.map(|_| ()) })
    };
    tokio::task::yield_now().await;

    pool.shutdown().await;
    assert!(matches!(queued.await.unwrap(), Err(AppError::PoolShutdown)));
    assert!(matches!(
        pool.acquire_default().await,
        Err(AppError::PoolShutdown)
    ));

    let id = lease.id();
    pool.release(lease);
    tokio::task::yield_now().await;
    assert_eq!(factory.closed(), vec![id]);
}
