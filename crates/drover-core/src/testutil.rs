//! Test utilities: mock implementations of the pool traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` or atomics for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::traits::{LifecycleNotifier, ResourceFactory, ResourceId, ScopedResource, UnitProfile};

// ---------------------------------------------------------------------------
// MockResource / MockUnit
// ---------------------------------------------------------------------------

/// Stand-in for a browser session.
#[derive(Debug)]
pub struct MockResource {
    pub id: ResourceId,
    units_opened: Arc<AtomicUsize>,
    units_closed: Arc<AtomicUsize>,
}

/// Stand-in for a browser page, carrying the profile it was opened with.
#[derive(Debug, Clone)]
pub struct MockUnit {
    pub resource_id: ResourceId,
    pub serial: usize,
    pub headers: Vec<(String, String)>,
    pub user_agent: Option<String>,
}

impl ScopedResource for MockResource {
    type Unit = MockUnit;

    async fn open_unit(&self, profile: &UnitProfile) -> Result<MockUnit, AppError> {
        let serial = self.units_opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockUnit {
            resource_id: self.id,
            serial,
            headers: profile.headers.clone(),
            user_agent: profile.user_agent.clone(),
        })
    }

    async fn close_unit(&self, _unit: MockUnit) {
        self.units_closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockFactory
// ---------------------------------------------------------------------------

/// Factory that builds [`MockResource`]s and records what happened to them.
#[derive(Clone, Default)]
pub struct MockFactory {
    created: Arc<AtomicU64>,
    /// Number of upcoming `create` calls that should fail.
    fail_next: Arc<AtomicU64>,
    create_delay: Option<Duration>,
    notifiers: Arc<Mutex<HashMap<ResourceId, LifecycleNotifier>>>,
    closed: Arc<Mutex<Vec<ResourceId>>>,
    units_opened: Arc<AtomicUsize>,
    units_closed: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` constructions fail with `ResourceCreation`.
    pub fn failing_first(n: u64) -> Self {
        let factory = Self::default();
        factory.fail_next.store(n, Ordering::SeqCst);
        factory
    }

    /// Every construction sleeps for `delay` first (simulates a browser launch).
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Simulate the resource's connection dying.
    pub fn disconnect(&self, id: ResourceId) {
        if let Some(notifier) = self.notifiers.lock().unwrap().get(&id) {
            notifier.notify_disconnected();
        }
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<ResourceId> {
        self.closed.lock().unwrap().clone()
    }

    pub fn units_opened(&self) -> usize {
        self.units_opened.load(Ordering::SeqCst)
    }

    pub fn units_closed(&self) -> usize {
        self.units_closed.load(Ordering::SeqCst)
    }
}

impl ResourceFactory for MockFactory {
    type Resource = MockResource;

    async fn create(
        &self,
        id: ResourceId,
        lifecycle: LifecycleNotifier,
    ) -> Result<MockResource, AppError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AppError::ResourceCreation("mock launch failed".into()));
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        self.notifiers.lock().unwrap().insert(id, lifecycle);
        Ok(MockResource {
            id,
            units_opened: Arc::clone(&self.units_opened),
            units_closed: Arc::clone(&self.units_closed),
        })
    }

    async fn close(&self, resource: Arc<MockResource>) {
        self.notifiers.lock().unwrap().remove(&resource.id);
        self.closed.lock().unwrap().push(resource.id);
    }
}
