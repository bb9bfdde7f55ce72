use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drover_core::{
    AppError, LifecycleNotifier, ResourceFactory, ResourceId, ScopedResource, UnitProfile,
};

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drover_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A pretend browser: tracks open pages and can be made to crash.
pub struct FakeBrowser {
    pub id: ResourceId,
    next_page: AtomicU64,
    open_pages: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct FakePage {
    pub browser: ResourceId,
    pub page: u64,
    pub user_agent: Option<String>,
}

impl ScopedResource for FakeBrowser {
    type Unit = FakePage;

    async fn open_unit(&self, profile: &UnitProfile) -> Result<FakePage, AppError> {
        let page = self.next_page.fetch_add(1, Ordering::SeqCst);
        self.open_pages.fetch_add(1, Ordering::SeqCst);
        Ok(FakePage {
            browser: self.id,
            page,
            user_agent: profile.user_agent.clone(),
        })
    }

    async fn close_unit(&self, _unit: FakePage) {
        self.open_pages.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Launches [`FakeBrowser`]s after a configurable delay.
#[derive(Clone, Default)]
pub struct FakeBrowserFactory {
    launch_delay: Duration,
    launched: Arc<AtomicU64>,
    notifiers: Arc<Mutex<HashMap<ResourceId, LifecycleNotifier>>>,
    closed: Arc<Mutex<Vec<ResourceId>>>,
    open_pages: Arc<AtomicU64>,
}

impl FakeBrowserFactory {
    pub fn new(launch_delay: Duration) -> Self {
        Self {
            launch_delay,
            ..Default::default()
        }
    }

    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<ResourceId> {
        self.closed.lock().unwrap().clone()
    }

    /// Simulate the browser process dying.
    pub fn crash(&self, id: ResourceId) {
        if let Some(notifier) = self.notifiers.lock().unwrap().get(&id) {
            notifier.notify_disconnected();
        }
    }

    /// Pages opened across all browsers and not yet closed.
    pub fn open_pages(&self) -> u64 {
        self.open_pages.load(Ordering::SeqCst)
    }
}

impl ResourceFactory for FakeBrowserFactory {
    type Resource = FakeBrowser;

    async fn create(
        &self,
        id: ResourceId,
        lifecycle: LifecycleNotifier,
    ) -> Result<FakeBrowser, AppError> {
        tokio::time::sleep(self.launch_delay).await;
        self.launched.fetch_add(1, Ordering::SeqCst);
        self.notifiers.lock().unwrap().insert(id, lifecycle);
        Ok(FakeBrowser {
            id,
            next_page: AtomicU64::new(1),
            open_pages: Arc::clone(&self.open_pages),
        })
    }

    async fn close(&self, resource: Arc<FakeBrowser>) {
        self.notifiers.lock().unwrap().remove(&resource.id);
        self.closed.lock().unwrap().push(resource.id);
    }
}
