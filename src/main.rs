use std::sync::Arc;
use std::time::Duration;

use aegis_optimizer::config::{Dataset, ServiceConfig};
use aegis_optimizer::handlers::AppState;
use aegis_optimizer::jobs::OptimizationController;
use aegis_optimizer::web_app::build_app;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::from_env()?;
    let dataset = match &config.dataset_path {
        Some(path) => Dataset::from_json_file(path)?,
        None => {
            warn!("AEGIS_DATASET is not set; serving empty portfolio and price stores");
            Dataset::default()
        }
    };
    let (prices, store) = dataset.into_collaborators(config.market_suffixes.clone());
    info!(portfolios = store.len(), "dataset loaded");

    let controller = Arc::new(OptimizationController::new(
        Arc::new(prices),
        Arc::new(store),
        config.clone(),
    ));
    let janitor = controller.spawn_janitor((config.job_ttl / 4).max(Duration::from_secs(1)));

    let app = build_app(AppState { controller });
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(
        address = %config.bind_address,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "optimizer listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    janitor.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
