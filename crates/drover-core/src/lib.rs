pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod schedule;
pub mod scheduler;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use cache::{CacheRegion, RegionStats, TieredCache};
pub use config::{CacheConfig, DroverConfig, PoolConfig, RegionConfig, SchedulerConfig};
pub use context::{Drover, HealthReport};
pub use error::AppError;
pub use pool::{Lease, PoolStats, ResourcePool, ScopedUnit};
pub use schedule::Schedule;
pub use scheduler::{JobRecord, JobScheduler, RetryPolicy, RunOutcome, TaskOutput, TaskSpec};
pub use traits::{LifecycleNotifier, ResourceFactory, ResourceId, ScopedResource, UnitProfile};
