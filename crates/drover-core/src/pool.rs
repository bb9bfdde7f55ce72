//! Bounded pool of heavyweight execution units (headless browsers).
//!
//! Callers borrow a resource through a [`Lease`]. Leases return their
//! resource when released or dropped, so a caller that errors, panics or is
//! cancelled never leaks a capacity slot.
//!
//! ```text
//! acquire ──> idle resource?  ──yes──> Active
//!                 │ no
//!                 ├── total < max ──> construct ──> Active
//!                 └── enqueue (FIFO, deadline) ──> handed a resource or a
//!                                                  construction slot by
//!                                                  release / capacity freeing
//! ```
//!
//! Invariant: `active ≤ total ≤ max_size`, where `total` counts live
//! resources plus constructions in flight. A released resource goes straight
//! to the oldest waiter before it is ever marked idle.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sysinfo::SystemExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::AppError;
use crate::traits::{LifecycleNotifier, ResourceFactory, ResourceId, ScopedResource};

/// Lifecycle state of a pooled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceState {
    Idle,
    Active,
    /// Reported dead while leased; dropped from the pool once the lease returns.
    Removed,
}

struct PooledResource<R> {
    id: ResourceId,
    state: ResourceState,
    created_at: Instant,
    last_used: Instant,
    resource: Arc<R>,
}

/// Pool statistics for health reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub active: usize,
    pub idle: usize,
    /// Live resources plus constructions in flight.
    pub total: usize,
    pub creating: usize,
    pub queue_length: usize,
    pub acquisitions: u64,
    pub handoffs: u64,
    pub created: u64,
    pub creation_failures: u64,
    pub timeouts: u64,
    pub disconnects: u64,
    pub reaped: u64,
    pub shutdown: bool,
    /// Resident memory of this process, when the platform reports it.
    pub memory_bytes: Option<u64>,
}

#[derive(Default)]
struct PoolCounters {
    acquisitions: AtomicU64,
    handoffs: AtomicU64,
    created: AtomicU64,
    creation_failures: AtomicU64,
    timeouts: AtomicU64,
    disconnects: AtomicU64,
    reaped: AtomicU64,
}

enum Handoff<F: ResourceFactory> {
    Resource(Lease<F>),
    /// Capacity freed up; the waiter constructs its own resource.
    Slot(CreationSlot<F>),
}

impl<F: ResourceFactory> Handoff<F> {
    /// Neutralise a handoff that could not be delivered so its destructor
    /// does not touch pool state. The caller still owns the bookkeeping.
    fn defuse(self) {
        match self {
            Handoff::Resource(mut lease) => {
                lease.resource.take();
            }
            Handoff::Slot(mut slot) => slot.armed = false,
        }
    }
}

enum AcquireStep<F: ResourceFactory> {
    Ready(Lease<F>),
    Create(CreationSlot<F>),
    Wait(u64, oneshot::Receiver<Handoff<F>>),
}

struct Waiter<F: ResourceFactory> {
    id: u64,
    deadline: Instant,
    tx: oneshot::Sender<Handoff<F>>,
}

struct PoolState<F: ResourceFactory> {
    resources: Vec<PooledResource<F::Resource>>,
    active: usize,
    creating: usize,
    waiters: VecDeque<Waiter<F>>,
    next_waiter_id: u64,
    shutdown: bool,
    lifecycle_rx: mpsc::UnboundedReceiver<ResourceId>,
}

impl<F: ResourceFactory> PoolState<F> {
    fn live(&self) -> usize {
        self.resources
            .iter()
            .filter(|r| r.state != ResourceState::Removed)
            .count()
    }

    fn total(&self) -> usize {
        self.live() + self.creating
    }

    fn position(&self, id: ResourceId) -> Option<usize> {
        self.resources.iter().position(|r| r.id == id)
    }
}

struct PoolInner<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F>>,
    lifecycle_tx: mpsc::UnboundedSender<ResourceId>,
    next_resource_id: AtomicU64,
    counters: PoolCounters,
    system: Mutex<sysinfo::System>,
}

/// Bounded, FIFO-fair pool of resources built by a [`ResourceFactory`].
///
/// Cloning is cheap; all clones share one pool.
pub struct ResourcePool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let state = PoolState {
            resources: Vec::with_capacity(config.max_size),
            active: 0,
            creating: 0,
            waiters: VecDeque::new(),
            next_waiter_id: 0,
            shutdown: false,
            lifecycle_rx,
        };
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(state),
                lifecycle_tx,
                next_resource_id: AtomicU64::new(1),
                counters: PoolCounters::default(),
                system: Mutex::new(sysinfo::System::new()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Acquire with the configured `acquire_timeout`.
    pub async fn acquire_default(&self) -> Result<Lease<F>, AppError> {
        self.acquire(self.inner.config.acquire_timeout).await
    }

    /// Borrow a resource, waiting at most `timeout` in the FIFO queue.
    pub async fn acquire(&self, timeout: Duration) -> Result<Lease<F>, AppError> {
        let lease = self.inner.acquire(timeout).await?;
        self.inner
            .counters
            .acquisitions
            .fetch_add(1, Ordering::Relaxed);
        Ok(lease)
    }

    /// Return a resource. Equivalent to dropping the lease.
    pub fn release(&self, lease: Lease<F>) {
        drop(lease);
    }

    /// Run `op` with a borrowed resource using the configured acquire timeout.
    pub async fn execute<T, E, Op, Fut>(&self, op: Op) -> Result<T, E>
    where
        Op: FnOnce(Arc<F::Resource>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AppError>,
    {
        self.execute_with_timeout(op, self.inner.config.acquire_timeout)
            .await
    }

    /// Acquire, run `op`, release. The resource is returned on every exit
    /// path, including cancellation; the operation's result is passed through
    /// untouched.
    pub async fn execute_with_timeout<T, E, Op, Fut>(
        &self,
        op: Op,
        timeout: Duration,
    ) -> Result<T, E>
    where
        Op: FnOnce(Arc<F::Resource>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AppError>,
    {
        let lease = self.acquire(timeout).await?;
        let result = op(lease.resource()).await;
        if result.is_err() {
            tracing::debug!(resource_id = %lease.id(), "Operation failed, releasing resource");
        }
        self.release(lease);
        result
    }

    /// Open a scoped unit (browser page) on a leased resource, configured with
    /// the pool's [`UnitProfile`](crate::traits::UnitProfile).
    pub async fn new_scoped_unit(
        &self,
        lease: &Lease<F>,
    ) -> Result<ScopedUnit<F::Resource>, AppError>
    where
        F::Resource: ScopedResource,
    {
        let resource = lease.resource();
        let unit = resource
            .open_unit(&self.inner.config.unit_profile)
            .await?;
        Ok(ScopedUnit {
            resource,
            unit: Some(unit),
        })
    }

    /// Like [`execute`](Self::execute), but hands `op` a fresh scoped unit
    /// that is closed as soon as `op` finishes.
    pub async fn execute_scoped<T, E, Op, Fut>(&self, op: Op) -> Result<T, E>
    where
        F::Resource: ScopedResource,
        <F::Resource as ScopedResource>::Unit: Clone,
        Op: FnOnce(<F::Resource as ScopedResource>::Unit) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AppError>,
    {
        let lease = self.acquire_default().await?;
        let unit = self.new_scoped_unit(&lease).await?;
        let result = op(unit.unit().clone()).await;
        unit.close().await;
        self.release(lease);
        result
    }

    /// Pre-create resources until `min_idle` are live. Returns how many were built.
    pub async fn warm_up(&self) -> Result<usize, AppError> {
        let mut created = 0;
        loop {
            let slot = {
                let mut state = self.inner.lock_state();
                self.inner.drain_lifecycle(&mut state);
                if state.shutdown {
                    return Err(AppError::PoolShutdown);
                }
                if state.total() >= self.inner.config.min_idle {
                    break;
                }
                state.creating += 1;
                CreationSlot::new(&self.inner)
            };
            // Dropping the lease parks it idle, or hands it to a waiter that
            // showed up meanwhile.
            drop(self.inner.create_with_slot(slot).await?);
            created += 1;
        }
        if created > 0 {
            tracing::info!(created, "Pool warmed up");
        }
        Ok(created)
    }

    /// Close idle resources unused for longer than `idle_timeout`, keeping at
    /// least `min_idle` live. Returns the number closed.
    pub async fn reap(&self, idle_timeout: Duration) -> usize {
        let victims = {
            let mut state = self.inner.lock_state();
            self.inner.drain_lifecycle(&mut state);
            let mut candidates: Vec<(Instant, ResourceId)> = state
                .resources
                .iter()
                .filter(|r| {
                    r.state == ResourceState::Idle && r.last_used.elapsed() > idle_timeout
                })
                .map(|r| (r.last_used, r.id))
                .collect();
            candidates.sort();

            let removable = state
                .live()
                .saturating_sub(self.inner.config.min_idle)
                .min(candidates.len());
            let mut victims = Vec::with_capacity(removable);
            for (_, id) in candidates.into_iter().take(removable) {
                if let Some(idx) = state.position(id) {
                    victims.push(state.resources.remove(idx));
                }
            }
            if !victims.is_empty() {
                self.inner.dispatch_capacity(&mut state);
            }
            victims
        };

        let count = victims.len();
        for entry in victims {
            tracing::debug!(
                resource_id = %entry.id,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                "Reaping idle resource"
            );
            self.inner.factory.close(entry.resource).await;
        }
        if count > 0 {
            self.inner
                .counters
                .reaped
                .fetch_add(count as u64, Ordering::Relaxed);
            tracing::info!(reaped = count, "Closed idle resources");
        }
        count
    }

    /// Run [`reap`](Self::reap) every `reap_interval` until `cancel` fires.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let interval = pool.inner.config.reap_interval;
            let idle_timeout = pool.inner.config.idle_timeout;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        pool.reap(idle_timeout).await;
                    }
                    () = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Pool reaper stopped");
        })
    }

    /// Reject all queued and future acquires and close every idle resource.
    /// Leased resources are closed as their leases come back.
    pub async fn shutdown(&self) {
        let (idle, rejected) = {
            let mut state = self.inner.lock_state();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.inner.drain_lifecycle(&mut state);
            // Dropping the senders wakes every waiter, which then observes
            // the shutdown flag.
            let rejected = state.waiters.drain(..).count();
            let (idle, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.resources)
                .into_iter()
                .partition(|r| r.state == ResourceState::Idle);
            state.resources = kept;
            (idle, rejected)
        };

        tracing::info!(
            closing = idle.len(),
            rejected_waiters = rejected,
            "Shutting down resource pool"
        );
        for entry in idle {
            self.inner.factory.close(entry.resource).await;
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock_state().shutdown
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = {
            let mut state = self.inner.lock_state();
            self.inner.drain_lifecycle(&mut state);
            let idle = state
                .resources
                .iter()
                .filter(|r| r.state == ResourceState::Idle)
                .count();
            PoolStats {
                max_size: self.inner.config.max_size,
                active: state.active,
                idle,
                total: state.total(),
                creating: state.creating,
                queue_length: state.waiters.len(),
                shutdown: state.shutdown,
                ..Default::default()
            }
        };
        let c = &self.inner.counters;
        stats.acquisitions = c.acquisitions.load(Ordering::Relaxed);
        stats.handoffs = c.handoffs.load(Ordering::Relaxed);
        stats.created = c.created.load(Ordering::Relaxed);
        stats.creation_failures = c.creation_failures.load(Ordering::Relaxed);
        stats.timeouts = c.timeouts.load(Ordering::Relaxed);
        stats.disconnects = c.disconnects.load(Ordering::Relaxed);
        stats.reaped = c.reaped.load(Ordering::Relaxed);
        stats.memory_bytes = self.inner.process_memory_bytes();
        stats
    }
}

impl<F: ResourceFactory> PoolInner<F> {
    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> MutexGuard<'_, PoolState<F>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned pool mutex");
            poisoned.into_inner()
        })
    }

    async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Lease<F>, AppError> {
        let deadline = Instant::now() + timeout;

        match self.try_acquire(deadline)? {
            AcquireStep::Ready(lease) => Ok(lease),
            AcquireStep::Create(slot) => self.create_with_slot(slot).await,
            AcquireStep::Wait(waiter_id, rx) => {
                self.wait_for_handoff(waiter_id, rx, deadline, timeout)
                    .await
            }
        }
    }

    /// The synchronous half of acquire: take an idle resource, reserve a
    /// construction slot, or join the wait queue.
    fn try_acquire(self: &Arc<Self>, deadline: Instant) -> Result<AcquireStep<F>, AppError> {
        let mut state = self.lock_state();
        self.drain_lifecycle(&mut state);
        if state.shutdown {
            return Err(AppError::PoolShutdown);
        }

        if let Some(entry) = state
            .resources
            .iter_mut()
            .filter(|r| r.state == ResourceState::Idle)
            .min_by_key(|r| r.last_used)
        {
            entry.state = ResourceState::Active;
            entry.last_used = Instant::now();
            let lease = Lease::new(self, entry.id, Arc::clone(&entry.resource));
            state.active += 1;
            tracing::debug!(resource_id = %lease.id, "Reusing longest-idle resource");
            return Ok(AcquireStep::Ready(lease));
        }

        if state.total() < self.config.max_size {
            state.creating += 1;
            return Ok(AcquireStep::Create(CreationSlot::new(self)));
        }

        let waiter_id = state.next_waiter_id;
        state.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            id: waiter_id,
            deadline,
            tx,
        });
        tracing::debug!(
            waiter_id,
            queue_length = state.waiters.len(),
            "Pool saturated, queueing acquire"
        );
        Ok(AcquireStep::Wait(waiter_id, rx))
    }

    async fn wait_for_handoff(
        self: &Arc<Self>,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Handoff<F>>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Lease<F>, AppError> {
        let mut guard = QueuedWaiter {
            pool: self,
            id: waiter_id,
            queued: true,
        };

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(handoff)) => {
                guard.queued = false;
                self.accept(handoff).await
            }
            Ok(Err(_)) => {
                // Sender dropped: either shutdown, or we expired in the queue.
                guard.queued = false;
                if self.lock_state().shutdown {
                    Err(AppError::PoolShutdown)
                } else {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(AppError::PoolTimeout(timeout))
                }
            }
            Err(_) => {
                let still_queued = self.remove_waiter(waiter_id);
                guard.queued = false;
                if still_queued {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        waiter_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Timed out waiting for a pooled resource"
                    );
                    return Err(AppError::PoolTimeout(timeout));
                }
                // A release dequeued us right at the deadline; the handoff is
                // already in the channel.
                match rx.try_recv() {
                    Ok(handoff) => self.accept(handoff).await,
                    Err(_) => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        Err(AppError::PoolTimeout(timeout))
                    }
                }
            }
        }
    }

    async fn accept(self: &Arc<Self>, handoff: Handoff<F>) -> Result<Lease<F>, AppError> {
        match handoff {
            Handoff::Resource(lease) => Ok(lease),
            Handoff::Slot(slot) => self.create_with_slot(slot).await,
        }
    }

    fn remove_waiter(&self, waiter_id: u64) -> bool {
        let mut state = self.lock_state();
        match state.waiters.iter().position(|w| w.id == waiter_id) {
            Some(idx) => {
                state.waiters.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Construct a resource into a reserved slot and lease it out.
    async fn create_with_slot(
        self: &Arc<Self>,
        mut slot: CreationSlot<F>,
    ) -> Result<Lease<F>, AppError> {
        let id = ResourceId(self.next_resource_id.fetch_add(1, Ordering::Relaxed));
        let notifier = LifecycleNotifier::new(id, self.lifecycle_tx.clone());

        let resource = match self.factory.create(id, notifier).await {
            Ok(resource) => Arc::new(resource),
            Err(e) => {
                self.counters
                    .creation_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(resource_id = %id, error = %e, "Resource creation failed");
                // Dropping the armed slot frees the capacity for the next waiter.
                drop(slot);
                return Err(match e {
                    AppError::ResourceCreation(_) => e,
                    other => AppError::ResourceCreation(other.to_string()),
                });
            }
        };

        {
            let mut state = self.lock_state();
            slot.armed = false;
            state.creating -= 1;
            if !state.shutdown {
                let now = Instant::now();
                state.resources.push(PooledResource {
                    id,
                    state: ResourceState::Active,
                    created_at: now,
                    last_used: now,
                    resource: Arc::clone(&resource),
                });
                state.active += 1;
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                tracing::info!(resource_id = %id, total = state.total(), "Created pooled resource");
                return Ok(Lease::new(self, id, resource));
            }
        }

        self.factory.close(resource).await;
        Err(AppError::PoolShutdown)
    }

    /// Bookkeeping for a returned lease.
    fn release_entry(self: &Arc<Self>, id: ResourceId, resource: Arc<F::Resource>) {
        let mut to_close = Vec::new();
        {
            let mut state = self.lock_state();
            self.drain_lifecycle(&mut state);

            match state.position(id) {
                None => {
                    tracing::warn!(resource_id = %id, "Released resource unknown to pool");
                }
                Some(idx) if state.resources[idx].state == ResourceState::Removed => {
                    tracing::debug!(resource_id = %id, "Dropping dead resource on release");
                    state.resources.remove(idx);
                    to_close.push(resource);
                }
                Some(idx) if state.shutdown => {
                    state.resources.remove(idx);
                    state.active -= 1;
                    to_close.push(resource);
                }
                Some(idx) => self.hand_over_or_idle(&mut state, idx),
            }
        }
        self.spawn_close(to_close);
    }

    /// Give the resource at `idx` to the oldest live waiter, or park it idle.
    fn hand_over_or_idle(self: &Arc<Self>, state: &mut PoolState<F>, idx: usize) {
        let now = Instant::now();
        let id = state.resources[idx].id;
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.deadline <= now || waiter.tx.is_closed() {
                continue;
            }
            let lease = Lease::new(self, id, Arc::clone(&state.resources[idx].resource));
            match waiter.tx.send(Handoff::Resource(lease)) {
                Ok(()) => {
                    state.resources[idx].last_used = now;
                    self.counters.handoffs.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(resource_id = %id, waiter_id = waiter.id, "Handed resource to waiter");
                    return;
                }
                Err(handoff) => handoff.defuse(),
            }
        }
        let entry = &mut state.resources[idx];
        entry.state = ResourceState::Idle;
        entry.last_used = now;
        state.active -= 1;
    }

    /// Hand construction slots to waiters while there is spare capacity.
    fn dispatch_capacity(self: &Arc<Self>, state: &mut PoolState<F>) {
        let now = Instant::now();
        while !state.shutdown && state.total() < self.config.max_size {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.deadline <= now || waiter.tx.is_closed() {
                continue;
            }
            state.creating += 1;
            match waiter.tx.send(Handoff::Slot(CreationSlot::new(self))) {
                Ok(()) => {
                    tracing::debug!(waiter_id = waiter.id, "Granted construction slot to waiter");
                }
                Err(handoff) => {
                    handoff.defuse();
                    state.creating -= 1;
                }
            }
        }
    }

    /// Apply pending disconnect notifications. Dead idle resources are
    /// closed in the background.
    fn drain_lifecycle(self: &Arc<Self>, state: &mut PoolState<F>) {
        let mut dead = Vec::new();
        while let Ok(id) = state.lifecycle_rx.try_recv() {
            let Some(idx) = state.position(id) else {
                continue;
            };
            match state.resources[idx].state {
                ResourceState::Active => {
                    state.resources[idx].state = ResourceState::Removed;
                    state.active -= 1;
                    self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(resource_id = %id, "Leased resource disconnected");
                }
                ResourceState::Idle => {
                    dead.push(state.resources.remove(idx).resource);
                    self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(resource_id = %id, "Idle resource disconnected");
                }
                ResourceState::Removed => continue,
            }
            self.dispatch_capacity(state);
        }
        self.spawn_close(dead);
    }

    fn abandon_slot(self: &Arc<Self>) {
        let mut state = self.lock_state();
        state.creating -= 1;
        self.dispatch_capacity(&mut state);
    }

    /// Resident memory of this process. The `System` handle is kept across
    /// calls and only the current process is refreshed.
    fn process_memory_bytes(&self) -> Option<u64> {
        use sysinfo::ProcessExt;

        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_process(pid);
        system.process(pid).map(|process| process.memory())
    }

    /// Close resources in the background. Safe to call from destructors.
    fn spawn_close(self: &Arc<Self>, resources: Vec<Arc<F::Resource>>) {
        if resources.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    for resource in resources {
                        inner.factory.close(resource).await;
                    }
                });
            }
            Err(_) => {
                tracing::debug!(
                    count = resources.len(),
                    "No runtime available, dropping resources without close"
                );
            }
        }
    }
}

/// Removes a queued waiter if its acquire future is dropped mid-wait.
struct QueuedWaiter<'a, F: ResourceFactory> {
    pool: &'a Arc<PoolInner<F>>,
    id: u64,
    queued: bool,
}

impl<F: ResourceFactory> Drop for QueuedWaiter<'_, F> {
    fn drop(&mut self) {
        if self.queued {
            self.pool.remove_waiter(self.id);
        }
    }
}

/// A reserved unit of capacity for one resource construction.
struct CreationSlot<F: ResourceFactory> {
    pool: Arc<PoolInner<F>>,
    armed: bool,
}

impl<F: ResourceFactory> CreationSlot<F> {
    fn new(pool: &Arc<PoolInner<F>>) -> Self {
        Self {
            pool: Arc::clone(pool),
            armed: true,
        }
    }
}

impl<F: ResourceFactory> Drop for CreationSlot<F> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon_slot();
        }
    }
}

/// Exclusive borrow of one pooled resource.
///
/// Dropping the lease releases the resource; there is no way to release it twice.
pub struct Lease<F: ResourceFactory> {
    pool: Arc<PoolInner<F>>,
    id: ResourceId,
    resource: Option<Arc<F::Resource>>,
    leased_at: Instant,
}

impl<F: ResourceFactory> Lease<F> {
    fn new(pool: &Arc<PoolInner<F>>, id: ResourceId, resource: Arc<F::Resource>) -> Self {
        Self {
            pool: Arc::clone(pool),
            id,
            resource: Some(resource),
            leased_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn resource(&self) -> Arc<F::Resource> {
        Arc::clone(self.get())
    }

    pub fn held_for(&self) -> Duration {
        self.leased_at.elapsed()
    }

    fn get(&self) -> &Arc<F::Resource> {
        self.resource
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease accessed after release"))
    }
}

impl<F: ResourceFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl<F: ResourceFactory> Deref for Lease<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.get()
    }
}

impl<F: ResourceFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release_entry(self.id, resource);
        }
    }
}

/// A sub-context opened on a pooled resource. Closed by [`close`](Self::close),
/// or in the background if dropped.
pub struct ScopedUnit<R: ScopedResource> {
    resource: Arc<R>,
    unit: Option<R::Unit>,
}

impl<R: ScopedResource> ScopedUnit<R> {
    pub fn unit(&self) -> &R::Unit {
        self.unit
            .as_ref()
            .unwrap_or_else(|| unreachable!("scoped unit accessed after close"))
    }

    pub async fn close(mut self) {
        if let Some(unit) = self.unit.take() {
            self.resource.close_unit(unit).await;
        }
    }
}

impl<R: ScopedResource> Deref for ScopedUnit<R> {
    type Target = R::Unit;

    fn deref(&self) -> &Self::Target {
        self.unit()
    }
}

impl<R: ScopedResource> Drop for ScopedUnit<R> {
    fn drop(&mut self) {
        let Some(unit) = self.unit.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let resource = Arc::clone(&self.resource);
            handle.spawn(async move {
                resource.close_unit(unit).await;
            });
        }
    }
}
