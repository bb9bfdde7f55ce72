//! The process-wide service context: one pool, one cache and one scheduler,
//! owned together and shut down together.

use std::sync::Mutex;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{RegionStats, TieredCache};
use crate::config::DroverConfig;
use crate::error::AppError;
use crate::pool::{PoolStats, ResourcePool};
use crate::scheduler::{JobRecord, JobScheduler};
use crate::traits::ResourceFactory;

/// Combined snapshot for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub pool: PoolStats,
    pub cache: Vec<RegionStats>,
    pub jobs: Vec<JobRecord>,
}

impl HealthReport {
    /// Healthy while the pool accepts work and no task's most recent run
    /// failed.
    pub fn is_healthy(&self) -> bool {
        !self.pool.shutdown && !self.jobs.iter().any(|job| job.last_run_failed)
    }
}

pub struct Drover<F: ResourceFactory, V = serde_json::Value> {
    config: DroverConfig,
    pool: ResourcePool<F>,
    cache: TieredCache<V>,
    scheduler: JobScheduler,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<F, V> Drover<F, V>
where
    F: ResourceFactory,
    V: Clone + Send + Sync + 'static,
{
    /// Validate `config`, build the services, warm the pool and start the
    /// reaper and sweeper. Tasks are registered on [`scheduler`](Self::scheduler)
    /// and only fire after [`start_scheduler`](Self::start_scheduler).
    pub async fn init(config: DroverConfig, factory: F) -> Result<Self, AppError> {
        config.validate()?;

        let pool = ResourcePool::new(factory, config.pool.clone());
        let cache = TieredCache::new(&config.cache);
        let scheduler = JobScheduler::new(config.scheduler.clone());
        let cancel = CancellationToken::new();

        // A browser that fails to launch now may launch on first acquire.
        if let Err(e) = pool.warm_up().await {
            tracing::warn!(error = %e, "Pool warm-up failed");
        }

        let background = vec![
            pool.spawn_reaper(cancel.child_token()),
            cache.spawn_sweeper(cancel.child_token()),
        ];

        tracing::info!(
            max_size = config.pool.max_size,
            min_idle = config.pool.min_idle,
            regions = config.cache.regions.len(),
            "Drover initialised"
        );

        Ok(Self {
            config,
            pool,
            cache,
            scheduler,
            cancel,
            background: Mutex::new(background),
        })
    }

    pub fn config(&self) -> &DroverConfig {
        &self.config
    }

    pub fn pool(&self) -> &ResourcePool<F> {
        &self.pool
    }

    pub fn cache(&self) -> &TieredCache<V> {
        &self.cache
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); hand clones to
    /// application loops that should stop with the context.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Begin firing every scheduled task. Returns the number of firing loops.
    pub fn start_scheduler(&self) -> usize {
        let handles = self.scheduler.start(self.cancel.child_token());
        let count = handles.len();
        self.lock_background().extend(handles);
        tracing::info!(tasks = count, "Scheduler started");
        count
    }

    /// Stop background loops, then shut the pool down. Task runs already in
    /// flight keep their leases until they finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.lock_background());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.pool.shutdown().await;
        tracing::info!("Drover shut down");
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            pool: self.pool.stats(),
            cache: self.cache.stats(),
            jobs: self.scheduler.get_status(),
        }
    }

    fn lock_background(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
