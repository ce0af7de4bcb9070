use std::sync::Arc;

use tracing::{info, warn};

use convopool::api::{self, AppState};
use convopool::gateway::HttpGateway;
use convopool::pool::{Heartbeat, PoolManager};
use convopool::provider::HttpProvider;
use convopool::{Config, MetadataStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    convopool::telemetry::init_tracing()?;

    let config = Config::from_env()?;
    if config.bearer_token.is_empty() {
        warn!("CONVOPOOL_TOKEN is empty; authenticated endpoints are open");
    }

    let provider = Arc::new(HttpProvider::new(
        config.provider_url.clone(),
        config.provider_token.clone(),
    ));
    let gateway = Arc::new(HttpGateway::new(config.probe_timeout));
    let store = MetadataStore::new(&config.data_dir)?;

    let manager = PoolManager::new(provider, gateway, store, config.clone());

    // The first tick rebuilds the cache from scratch; nothing in memory
    // survives a restart, so run it before accepting traffic.
    manager.tick().await;

    let reconciler = PoolManager::spawn_reconciler(manager.clone());
    let heartbeat_task = if config.heartbeat_enabled() {
        Some(Heartbeat::spawn(Heartbeat::new(manager.clone())))
    } else {
        info!("heartbeat disabled");
        None
    };

    let router = api::create_router(AppState {
        manager: manager.clone(),
    });
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        environment = %config.environment,
        min_idle = config.min_idle,
        max_total = config.max_total,
        "convopool listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight provider calls are abandoned; the next process start
    // reconciles whatever they left behind.
    reconciler.abort();
    if let Some(task) = heartbeat_task {
        task.abort();
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}
