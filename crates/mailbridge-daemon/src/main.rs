//! mailbridged - fetches external POP3 accounts into local mailboxes
//!
//! Usage: `mailbridged [config.toml]`. Without an argument the path comes
//! from `MAILBRIDGE_CONFIG`, then `mailbridge.toml` in the working directory.

use anyhow::Context;
use mailbridge_core::{
    Config, Database, MemoryProgress, NetworkConnector, Pop3Fetcher, Redeliverer, Scheduler,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MAILBRIDGE_CONFIG").ok())
        .unwrap_or_else(|| "mailbridge.toml".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("mailbridge=info".parse().unwrap()))
        .init();

    let path = config_path();
    let config = Config::load(&path).with_context(|| format!("Failed to load {}", path))?;
    tracing::info!("Starting mailbridged with {}", path);

    let db = Arc::new(
        Database::open(&config.database_path)
            .await
            .context("Failed to open database")?,
    );

    let fetcher = Arc::new(Pop3Fetcher::new(
        db.clone(),
        Arc::new(NetworkConnector),
        Arc::new(Redeliverer::new(config.delivery.clone())),
        config.fetch.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        db,
        fetcher,
        Arc::new(MemoryProgress::new()),
        config.fetch.clone(),
    ));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    let _ = shutdown.send(true);
    runner.await.context("Scheduler task failed")?;

    Ok(())
}
