//! Explicit configuration for the pool, cache and scheduler.
//!
//! Nothing in this crate reads process-wide state on its own: applications
//! build a [`DroverConfig`] (from defaults, JSON, or [`DroverConfig::from_env`])
//! and hand it to [`Drover::init`](crate::context::Drover::init).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::traits::UnitProfile;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

impl DroverConfig {
    /// Read configuration from `DROVER_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let config = Self {
            pool: PoolConfig::from_lookup(&lookup)?,
            cache: CacheConfig::from_lookup(&lookup)?,
            scheduler: SchedulerConfig::from_lookup(&lookup)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.pool.validate()?;
        self.cache.validate()?;
        self.scheduler.validate()
    }
}

/// Configuration for the resource pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on live resources (including ones being constructed).
    pub max_size: usize,
    /// Warm count the reaper never shrinks below.
    pub min_idle: usize,
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Idle resources unused for longer than this are closed by the reaper.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub reap_interval: Duration,
    /// Applied to every scoped unit (page) opened from a pooled resource.
    pub unit_profile: UnitProfile,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 3,
            min_idle: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
            unit_profile: UnitProfile::default(),
        }
    }
}

impl PoolConfig {
    /// - `DROVER_POOL_MAX_SIZE` (default 3)
    /// - `DROVER_POOL_MIN_IDLE` (default 0)
    /// - `DROVER_POOL_ACQUIRE_TIMEOUT_MS` (default 30000)
    /// - `DROVER_POOL_IDLE_TIMEOUT_MS` (default 300000)
    /// - `DROVER_POOL_REAP_INTERVAL_MS` (default 60000)
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            max_size: env_or(lookup, "DROVER_POOL_MAX_SIZE", defaults.max_size)?,
            min_idle: env_or(lookup, "DROVER_POOL_MIN_IDLE", defaults.min_idle)?,
            acquire_timeout: env_ms_or(
                lookup,
                "DROVER_POOL_ACQUIRE_TIMEOUT_MS",
                defaults.acquire_timeout,
            )?,
            idle_timeout: env_ms_or(lookup, "DROVER_POOL_IDLE_TIMEOUT_MS", defaults.idle_timeout)?,
            reap_interval: env_ms_or(
                lookup,
                "DROVER_POOL_REAP_INTERVAL_MS",
                defaults.reap_interval,
            )?,
            unit_profile: defaults.unit_profile,
        })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_size == 0 {
            return Err(AppError::ConfigError(
                "pool.max_size must be at least 1".into(),
            ));
        }
        if self.min_idle > self.max_size {
            return Err(AppError::ConfigError(format!(
                "pool.min_idle ({}) must not exceed pool.max_size ({})",
                self.min_idle, self.max_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "pool.acquire_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// A named cache region and its default time-to-live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl RegionConfig {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
        }
    }
}

/// Configuration for the tiered cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for regions created on first use without explicit configuration.
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    pub regions: Vec<RegionConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            regions: vec![
                RegionConfig::new("scrape", Duration::from_secs(30 * 60)),
                RegionConfig::new("analysis", Duration::from_secs(6 * 60 * 60)),
                RegionConfig::new("db", Duration::from_secs(5 * 60)),
            ],
        }
    }
}

impl CacheConfig {
    /// - `DROVER_CACHE_DEFAULT_TTL_MS` (default 300000)
    /// - `DROVER_CACHE_SWEEP_INTERVAL_MS` (default 60000)
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            default_ttl: env_ms_or(lookup, "DROVER_CACHE_DEFAULT_TTL_MS", defaults.default_ttl)?,
            sweep_interval: env_ms_or(
                lookup,
                "DROVER_CACHE_SWEEP_INTERVAL_MS",
                defaults.sweep_interval,
            )?,
            regions: defaults.regions,
        })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.default_ttl.is_zero() {
            return Err(AppError::ConfigError(
                "cache.default_ttl must be greater than zero".into(),
            ));
        }
        if let Some(region) = self.regions.iter().find(|r| r.ttl.is_zero()) {
            return Err(AppError::ConfigError(format!(
                "cache region '{}' has a zero ttl",
                region.name
            )));
        }
        Ok(())
    }
}

/// Configuration for the job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Attempts per run for tasks without their own retry policy.
    pub max_attempts: u32,
    /// Linear backoff base: attempt `n` waits `base_delay * n` before retrying.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Delay before a chained task fires, letting persistence settle.
    #[serde(with = "duration_ms")]
    pub chain_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            chain_delay: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// - `DROVER_RETRY_MAX_ATTEMPTS` (default 3)
    /// - `DROVER_RETRY_BASE_DELAY_MS` (default 5000)
    /// - `DROVER_CHAIN_DELAY_MS` (default 5000)
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: env_or(lookup, "DROVER_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay: env_ms_or(lookup, "DROVER_RETRY_BASE_DELAY_MS", defaults.base_delay)?,
            chain_delay: env_ms_or(lookup, "DROVER_CHAIN_DELAY_MS", defaults.chain_delay)?,
        })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "scheduler.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': expected a number"))
        }),
    }
}

fn env_ms_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, AppError> {
    let ms = env_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
