use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use spendthrone::{config::ThroneConfig, engine::ThroneService, server};

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("configs/mainnet.yaml"));
    let config = ThroneConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    init_tracing(config.monitoring.log_level.as_str())?;
    tracing::info!(name = %config.name, "starting spendthrone");
    let bind = config.server.bind.clone();
    let service = Arc::new(ThroneService::new(config)?);
    service.start();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, "listening, press Ctrl+C to stop");
    axum::serve(listener, server::router(service.clone()))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        })
        .await?;
    service.stop();
    Ok(())
}
