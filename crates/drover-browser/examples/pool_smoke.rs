/// Smoke-test for the browser pool.
///
/// Launches up to two headless Chromium processes, renders
/// <https://example.com> three times through pooled pages, and checks the
/// rendered HTML contains the expected `<h1>`.
///
/// Run with:
///   cargo run -p drover-browser --example pool_smoke --features browser
use drover_browser::{BrowserFactory, LaunchOptions};
use drover_core::{AppError, DroverConfig, ResourcePool};
use futures::future::join_all;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,drover_core=debug".into()),
        )
        .init();

    let config = DroverConfig::from_env()?;
    let mut pool_config = config.pool;
    pool_config.max_size = pool_config.max_size.min(2);

    println!("Launching browser pool (max {})…", pool_config.max_size);
    let pool = ResourcePool::new(BrowserFactory::new(LaunchOptions::from_env()?), pool_config);

    let url = "https://example.com";
    let fetches = (0..3).map(|_| {
        pool.execute_scoped(|page| async move {
            let html = page.fetch_html(url).await?;
            Ok::<_, AppError>(html)
        })
    });

    for (i, result) in join_all(fetches).await.into_iter().enumerate() {
        let html = result?;
        assert!(
            html.contains("<h1>Example Domain</h1>"),
            "Expected <h1> not found in rendered HTML"
        );
        println!("fetch {i}: OK, {} bytes", html.len());
    }

    let stats = pool.stats();
    println!(
        "created={} handoffs={} idle={} memory={:?}",
        stats.created, stats.handoffs, stats.idle, stats.memory_bytes
    );

    pool.shutdown().await;
    Ok(())
}
