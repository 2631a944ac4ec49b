use anyhow::Context;
use mimalloc::MiMalloc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seat_engine::{
    config::{Config, LogFormat},
    AppState,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::load().context("Failed to load configuration")?;

    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&config.app.rust_log));
    match config.app.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!(
        environment = %config.app.environment,
        lock_mode = ?config.booking.lock_mode,
        "Starting seat engine"
    );

    let sweep_interval = config.booking.sweep_interval();
    let state = AppState::new(config).await?;

    // --- Start background tasks ---

    // Очистка просроченных броней и висящих холдов
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = state.engine.cleanup.clone();
    let sweeper = tokio::spawn(async move {
        cleanup.run(sweep_interval, shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown_tx.send(true).ok();
    if let Err(e) = sweeper.await {
        error!("Cleanup task failed: {}", e);
    }

    state.db.close().await;
    info!("Seat engine stopped");
    Ok(())
}
