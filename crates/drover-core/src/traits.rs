use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AppError;

/// Identifier the pool assigns to every resource it constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

/// Handle a resource uses to tell its pool that it died.
///
/// The pool drains these notifications inside its own acquire/release/stats
/// calls, so a disconnect never mutates pool state from a foreign task.
#[derive(Debug, Clone)]
pub struct LifecycleNotifier {
    id: ResourceId,
    tx: mpsc::UnboundedSender<ResourceId>,
}

impl LifecycleNotifier {
    pub(crate) fn new(id: ResourceId, tx: mpsc::UnboundedSender<ResourceId>) -> Self {
        Self { id, tx }
    }

    pub fn resource_id(&self) -> ResourceId {
        self.id
    }

    /// Report that the resource disconnected. Safe to call more than once.
    pub fn notify_disconnected(&self) {
        // A closed channel means the pool is gone; nothing left to update.
        let _ = self.tx.send(self.id);
    }
}

/// Builds and tears down the heavyweight units a [`ResourcePool`](crate::pool::ResourcePool) manages.
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    /// Construct a new resource. `lifecycle` should be kept by whatever
    /// watches the resource's connection so it can report disconnects.
    fn create(
        &self,
        id: ResourceId,
        lifecycle: LifecycleNotifier,
    ) -> impl Future<Output = Result<Self::Resource, AppError>> + Send;

    /// Release the resource's underlying process/connection.
    fn close(&self, resource: Arc<Self::Resource>) -> impl Future<Output = ()> + Send;
}

/// A pooled resource that can open short-lived sub-contexts (browser pages).
pub trait ScopedResource: Send + Sync + 'static {
    type Unit: Send + 'static;

    fn open_unit(
        &self,
        profile: &UnitProfile,
    ) -> impl Future<Output = Result<Self::Unit, AppError>> + Send;

    fn close_unit(&self, unit: Self::Unit) -> impl Future<Output = ()> + Send;
}

/// Standard configuration applied to every scoped unit: headers, user agent
/// and URL patterns whose requests are blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitProfile {
    pub user_agent: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Glob-style URL patterns (`*.png`) that are never loaded.
    pub blocked_url_patterns: Vec<String>,
    #[serde(with = "crate::config::duration_ms")]
    pub navigation_timeout: Duration,
}

impl UnitProfile {
    /// Whether a request URL matches one of the blocked patterns.
    ///
    /// Only leading/trailing `*` wildcards are supported, matching what the
    /// browser's URL blocklist accepts.
    pub fn is_blocked(&self, url: &str) -> bool {
        self.blocked_url_patterns.iter().any(|pattern| {
            match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
                (Some(rest), _) if rest.ends_with('*') => {
                    url.contains(rest.trim_end_matches('*'))
                }
                (Some(suffix), _) => url.ends_with(suffix),
                (None, Some(prefix)) => url.starts_with(prefix),
                (None, None) => url == pattern,
            }
        })
    }
}

impl Default for UnitProfile {
    fn default() -> Self {
        Self {
            user_agent: Some(
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/124.0.0.0 Safari/537.36"
                    .to_string(),
            ),
            headers: vec![
                ("Accept-Language".into(), "en-US,en;q=0.9".into()),
                (
                    "Accept".into(),
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
                ),
            ],
            blocked_url_patterns: [
                "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.woff",
                "*.woff2", "*.ttf", "*.mp4", "*.webm", "*.mp3",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            navigation_timeout: Duration::from_secs(30),
        }
    }
}
