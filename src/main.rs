mod api;
mod clock;
mod collector;
mod config;
mod db;
mod detector;
mod error;
mod source;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::CollectorStats;
use crate::api::routes::{router, ApiState};
use crate::clock::{Clock, SystemClock};
use crate::collector::{Collector, CycleRunner};
use crate::config::Config;
use crate::db::{SqliteStore, Store};
use crate::detector::MovementDetector;
use crate::error::Result;
use crate::source::{MarketSource, PolymarketClient};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let sqlite = Arc::new(SqliteStore::connect(&cfg.db_path, cfg.store_retry_attempts).await?);
    let store: Arc<dyn Store> = sqlite.clone();

    // --- Collector ---
    let source: Arc<dyn MarketSource> = Arc::new(PolymarketClient::new(&cfg)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let detector = MovementDetector::new(Arc::clone(&store), cfg.movement_threshold, cfg.lookback_minutes);
    let runner = CycleRunner::new(
        source,
        Arc::clone(&store),
        detector,
        Arc::clone(&clock),
        Arc::new(CollectorStats::new()),
    );
    let collector = Arc::new(Collector::new(runner, Duration::from_secs(cfg.poll_interval_secs)));

    info!(
        threshold = cfg.movement_threshold,
        lookback_minutes = cfg.lookback_minutes,
        market_limit = cfg.market_limit,
        "Movement tracker configured: poll every {}s, minor threshold {:.1}%",
        cfg.poll_interval_secs,
        cfg.movement_threshold,
    );

    if cfg.collector_autostart {
        collector.start().await;
    } else {
        info!("COLLECTOR_AUTOSTART=false, collector waits for POST /collector");
    }

    // --- HTTP API server ---
    let app = router(ApiState {
        store,
        collector: Arc::clone(&collector),
        clock,
    });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    collector.shutdown().await;
    sqlite.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
