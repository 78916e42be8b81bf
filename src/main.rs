//! contrail - telemetry collector

use contrail::config::Config;
use contrail::db::{Kind, Store};
use contrail::pm2::Pm2Cli;
use contrail::scheduler::{Health, RetentionSweeper, Scheduler};
use contrail::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("contrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = Config::load()?;
    tracing::info!("Starting contrail on {}...", cfg.api.listen);
    tracing::info!("Using data directory {}", cfg.storage.directory.display());

    // Open the shard store
    let store = Arc::new(Store::open(&cfg.storage.directory)?);
    let shards: usize = Kind::ALL.into_iter().map(|kind| store.keys(kind).len()).sum();
    tracing::info!("Store opened with {} shards", shards);

    let health = Arc::new(Health::new());

    if cfg.storage.retention_days > 0 {
        tracing::info!("Keeping {} days of history", cfg.storage.retention_days);
        RetentionSweeper::new(store.clone(), cfg.storage.retention_days).start();
    } else {
        tracing::info!("Retention disabled");
    }

    // Start scrape loops
    Scheduler::new(store.clone(), health.clone()).start(&cfg.scrape.jobs)?;

    // Start web server
    let server = Server::new(cfg.api, store, health, Arc::new(Pm2Cli::default()));
    server.start().await?;

    Ok(())
}
