mod worker;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stalls_engine::ReservationEngine;
use stalls_store::app_config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stalls_worker=info,stalls_engine=info,stalls_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!(
        backend = ?config.store.backend,
        strategy = ?config.engine.strategy,
        "Starting stalls worker"
    );

    let engine = ReservationEngine::from_config(&config).context("Failed to build engine")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = engine
        .sweeper()
        .spawn(config.sweeper.interval(), shutdown_rx.clone());
    let logger = tokio::spawn(worker::run_event_logger(engine.subscribe(), shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    shutdown_tx.send(true).ok();
    sweeper.await.context("Sweeper task panicked")?;
    logger.await.context("Event logger task panicked")?;
    Ok(())
}
