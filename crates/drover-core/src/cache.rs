//! Named TTL cache regions with read-through `get_or_compute`.
//!
//! Each region is a [`moka::future::Cache`] whose per-entry expiry is the
//! entry's own TTL. Expiry is also checked against the entry's insertion time
//! on every read, so a value is never served once `now - inserted_at > ttl`,
//! regardless of when moka gets around to evicting it.
//!
//! Eviction is TTL-only. There is no capacity bound.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use moka::Expiry;
use moka::future::Cache;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;

/// One cached value and its expiry metadata.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub region: Arc<str>,
    pub key: String,
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

struct EntryExpiry;

impl<V> Expiry<String, Arc<CacheEntry<V>>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry<V>>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<CacheEntry<V>>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Per-region counters.
#[derive(Debug, Clone, Serialize)]
pub struct RegionStats {
    pub name: String,
    pub default_ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    pub live_keys: usize,
}

/// A named cache namespace with its own default TTL.
pub struct CacheRegion<V> {
    name: Arc<str>,
    default_ttl: Duration,
    store: Cache<String, Arc<CacheEntry<V>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl<V> Clone for CacheRegion<V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            default_ttl: self.default_ttl,
            store: self.store.clone(),
            hits: Arc::clone(&self.hits),
            misses: Arc::clone(&self.misses),
        }
    }
}

impl<V> CacheRegion<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new(name: &str, default_ttl: Duration) -> Self {
        let store = Cache::builder()
            .name(name)
            .expire_after(EntryExpiry)
            .build();
        Self {
            name: Arc::from(name),
            default_ttl,
            store,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Unexpired entry for `key`, dropping it if it has outlived its TTL.
    async fn live_entry(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        let entry = self.store.get(key).await?;
        if entry.is_expired() {
            self.store.invalidate(key).await;
            return None;
        }
        Some(entry)
    }

    /// Read a value without computing it on a miss.
    pub async fn get(&self, key: &str) -> Option<V> {
        match self.live_entry(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value with `ttl`, or the region default.
    pub async fn insert(&self, key: &str, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry {
            region: Arc::clone(&self.name),
            key: key.to_string(),
            value,
            inserted_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.store.insert(key.to_string(), Arc::new(entry)).await;
    }

    /// Return the cached value, or run `producer` and cache what it returns.
    ///
    /// A failed producer caches nothing and its error is returned unchanged,
    /// so the next call starts from scratch. Successful results are cached
    /// even when empty.
    pub async fn get_or_compute<E, P, Fut>(
        &self,
        key: &str,
        producer: P,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        P: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(entry) = self.live_entry(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(region = %self.name, key, "Cache hit");
            return Ok(entry.value.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(region = %self.name, key, "Cache miss, computing");
        let value = producer().await?;
        self.insert(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Remove every key containing `pattern`. Returns how many were removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let keys: Vec<Arc<String>> = self
            .store
            .iter()
            .filter(|(key, _)| key.contains(pattern))
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.store.invalidate(key.as_str()).await;
        }
        if !keys.is_empty() {
            tracing::info!(region = %self.name, pattern, removed = keys.len(), "Invalidated cache keys");
        }
        keys.len()
    }

    pub async fn clear(&self) {
        self.store.invalidate_all();
        self.store.run_pending_tasks().await;
    }

    /// Drop entries past their TTL. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<Arc<String>> = self
            .store
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.store.invalidate(key.as_str()).await;
        }
        self.store.run_pending_tasks().await;
        expired.len()
    }

    pub fn stats(&self) -> RegionStats {
        let live_keys = self
            .store
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .count();
        RegionStats {
            name: self.name.to_string(),
            default_ttl_ms: self.default_ttl.as_millis() as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            live_keys,
        }
    }
}

/// Registry of independent [`CacheRegion`]s.
///
/// Cloning is cheap; all clones share the same regions.
pub struct TieredCache<V = serde_json::Value> {
    regions: Arc<RwLock<HashMap<String, CacheRegion<V>>>>,
    default_ttl: Duration,
    sweep_interval: Duration,
}

impl<V> Clone for TieredCache<V> {
    fn clone(&self) -> Self {
        Self {
            regions: Arc::clone(&self.regions),
            default_ttl: self.default_ttl,
            sweep_interval: self.sweep_interval,
        }
    }
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Build a cache with the regions listed in `config` pre-created.
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Self {
            regions: Arc::new(RwLock::new(HashMap::new())),
            default_ttl: config.default_ttl,
            sweep_interval: config.sweep_interval,
        };
        for region in &config.regions {
            cache.region(&region.name, region.ttl);
        }
        cache
    }

    /// Return the region called `name`, creating it with `default_ttl` if it
    /// does not exist yet. An existing region keeps its original TTL.
    pub fn region(&self, name: &str, default_ttl: Duration) -> CacheRegion<V> {
        if let Some(region) = self.read_regions().get(name) {
            return region.clone();
        }
        let mut regions = self.regions.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned cache registry lock");
            poisoned.into_inner()
        });
        regions
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(region = name, ttl_ms = default_ttl.as_millis() as u64, "Created cache region");
                CacheRegion::new(name, default_ttl)
            })
            .clone()
    }

    /// Region lookup used by the convenience methods: unknown regions are
    /// created with the cache-wide default TTL.
    fn region_or_default(&self, name: &str) -> CacheRegion<V> {
        self.region(name, self.default_ttl)
    }

    fn read_regions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CacheRegion<V>>> {
        self.regions.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned cache registry lock");
            poisoned.into_inner()
        })
    }

    fn all_regions(&self) -> Vec<CacheRegion<V>> {
        self.read_regions().values().cloned().collect()
    }

    pub async fn get_or_compute<E, P, Fut>(
        &self,
        region: &str,
        key: &str,
        producer: P,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        P: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.region_or_default(region)
            .get_or_compute(key, producer, ttl)
            .await
    }

    pub async fn get(&self, region: &str, key: &str) -> Option<V> {
        self.region_or_default(region).get(key).await
    }

    pub async fn insert(&self, region: &str, key: &str, value: V, ttl: Option<Duration>) {
        self.region_or_default(region).insert(key, value, ttl).await;
    }

    /// Remove keys in `region` containing `pattern`. Unknown regions hold nothing.
    pub async fn invalidate(&self, region: &str, pattern: &str) -> usize {
        let region = self.read_regions().get(region).cloned();
        match region {
            Some(region) => region.invalidate(pattern).await,
            None => 0,
        }
    }

    pub async fn clear(&self, region: &str) {
        let region = self.read_regions().get(region).cloned();
        if let Some(region) = region {
            region.clear().await;
        }
    }

    /// Sweep expired entries from every region.
    pub async fn sweep(&self) -> usize {
        let mut removed = 0;
        for region in self.all_regions() {
            removed += region.sweep().await;
        }
        if removed > 0 {
            tracing::debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Per-region statistics, sorted by region name.
    pub fn stats(&self) -> Vec<RegionStats> {
        let mut stats: Vec<RegionStats> = self.all_regions().iter().map(|r| r.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(cache.sweep_interval) => {
                        cache.sweep().await;
                    }
                    () = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Cache sweeper stopped");
        })
    }
}
