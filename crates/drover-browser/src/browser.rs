use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, Headers, SetBlockedUrLsParams, SetExtraHttpHeadersParams,
};
use chromiumoxide::browser::HeadlessMode;
use chromiumoxide::{Browser, BrowserConfig, Page};
use drover_core::{
    AppError, LifecycleNotifier, ResourceFactory, ResourceId, ScopedResource, UnitProfile,
};
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::launch::LaunchOptions;

/// Launches one Chromium process per pooled resource.
///
/// # Example
///
/// ```rust,no_run
/// use drover_browser::{BrowserFactory, LaunchOptions};
/// use drover_core::{AppError, PoolConfig, ResourcePool};
///
/// # async fn run() -> Result<(), AppError> {
/// let pool = ResourcePool::new(BrowserFactory::new(LaunchOptions::from_env()?), PoolConfig::default());
/// let html = pool
///     .execute_scoped(|page| async move { page.fetch_html("https://example.com").await })
///     .await?;
/// println!("{}", &html[..200]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct BrowserFactory {
    options: LaunchOptions,
}

impl BrowserFactory {
    pub fn new(options: LaunchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    fn browser_config(&self, id: ResourceId) -> Result<BrowserConfig, AppError> {
        let mut builder = BrowserConfig::builder().disable_default_args();
        // chromiumoxide owns the headless flag and defaults to headless.
        builder = builder.headless_mode(headless_mode(&self.options));
        if self.options.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(bin) = self.options.resolve_executable() {
            tracing::info!(resource_id = %id, binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }
        builder
            .user_data_dir(self.options.profile_dir(id.0))
            .args(self.options.args())
            .build()
            .map_err(|e| AppError::ResourceCreation(format!("Browser config error: {e}")))
    }
}

fn headless_mode(options: &LaunchOptions) -> HeadlessMode {
    if options.headless {
        HeadlessMode::New
    } else {
        HeadlessMode::False
    }
}

impl ResourceFactory for BrowserFactory {
    type Resource = BrowserSession;

    async fn create(
        &self,
        id: ResourceId,
        lifecycle: LifecycleNotifier,
    ) -> Result<BrowserSession, AppError> {
        let config = self.browser_config(id)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::ResourceCreation(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to work. When it
        // stops, the browser is gone.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(resource_id = %id, error = %e, "Browser CDP handler error");
                    break;
                }
            }
            tracing::warn!(resource_id = %id, "Browser connection closed");
            lifecycle.notify_disconnected();
        });

        tracing::info!(resource_id = %id, "Browser launched");
        Ok(BrowserSession {
            id,
            browser,
            handler_task,
        })
    }

    async fn close(&self, session: Arc<BrowserSession>) {
        let id = session.id;
        match Arc::try_unwrap(session) {
            Ok(mut session) => {
                if let Err(e) = session.browser.close().await {
                    tracing::warn!(resource_id = %id, error = %e, "Browser did not close cleanly");
                }
                let _ = session.browser.wait().await;
                session.handler_task.abort();
            }
            // Someone still holds a page; the process exits once the last
            // handle drops and the handler task ends.
            Err(session) => session.handler_task.abort(),
        }
        tracing::info!(resource_id = %id, "Browser closed");
    }
}

/// A running Chromium process owned by the pool.
pub struct BrowserSession {
    id: ResourceId,
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl BrowserSession {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }
}

impl ScopedResource for BrowserSession {
    type Unit = ScopedPage;

    async fn open_unit(&self, profile: &UnitProfile) -> Result<ScopedPage, AppError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::Browser(format!("Failed to open page: {e}")))?;

        if let Err(e) = configure_page(&page, profile).await {
            let _ = page.close().await;
            return Err(e);
        }

        Ok(ScopedPage {
            page,
            navigation_timeout: profile.navigation_timeout,
        })
    }

    async fn close_unit(&self, unit: ScopedPage) {
        if let Err(e) = unit.page.close().await {
            tracing::debug!(resource_id = %self.id, error = %e, "Page already closed");
        }
    }
}

async fn configure_page(page: &Page, profile: &UnitProfile) -> Result<(), AppError> {
    let cdp = |e: chromiumoxide::error::CdpError| AppError::Browser(e.to_string());

    if let Some(ua) = &profile.user_agent {
        page.set_user_agent(ua.as_str()).await.map_err(cdp)?;
    }

    page.execute(EnableParams::default()).await.map_err(cdp)?;

    if !profile.headers.is_empty() {
        let headers: serde_json::Map<String, serde_json::Value> = profile
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(
            serde_json::Value::Object(headers),
        )))
        .await
        .map_err(cdp)?;
    }

    if !profile.blocked_url_patterns.is_empty() {
        page.execute(SetBlockedUrLsParams::new(profile.blocked_url_patterns.clone()))
            .await
            .map_err(cdp)?;
    }
    Ok(())
}

/// A browser tab opened for one operation, pre-configured with the pool's
/// [`UnitProfile`]. Closed by the pool when the operation ends.
#[derive(Debug, Clone)]
pub struct ScopedPage {
    page: Page,
    navigation_timeout: Duration,
}

impl ScopedPage {
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Navigate to `url` within the profile's navigation timeout.
    pub async fn goto(&self, url: &str) -> Result<(), AppError> {
        let navigation = async {
            self.page
                .goto(url)
                .await
                .map_err(|e| AppError::Browser(format!("Failed to navigate to {url}: {e}")))?;
            // <body> present is a minimal signal that the main content rendered.
            self.page
                .find_element("body")
                .await
                .map_err(|e| AppError::Browser(format!("Page did not render body: {e}")))?;
            Ok::<(), AppError>(())
        };

        match tokio::time::timeout(self.navigation_timeout, navigation).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Browser(format!(
                "Navigation to {url} timed out after {}ms",
                self.navigation_timeout.as_millis()
            ))),
        }
    }

    /// Navigate to `url` and return the rendered DOM.
    pub async fn fetch_html(&self, url: &str) -> Result<String, AppError> {
        self.goto(url).await?;
        self.page
            .content()
            .await
            .map_err(|e| AppError::Browser(format!("Failed to read page content: {e}")))
    }
}
