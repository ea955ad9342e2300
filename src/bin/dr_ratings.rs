use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use dr_ratings::api::{self, ApiState};
use dr_ratings::config::Config;
use dr_ratings::dr::DrClient;
use dr_ratings::live::LiveUpdater;
use dr_ratings::market::ALL_MARKETS;
use dr_ratings::scanner::{QuoteFetcher, ScannerClient};
use dr_ratings::snapshot::{SnapshotContext, run_market_scheduler};
use dr_ratings::store::Store;
use dr_ratings::{accuracy, init_logger, migrate};

#[derive(Parser, Debug)]
#[command(name = "dr_ratings")]
#[command(about = "DR ratings backend: scrapes the ratings scanner, keeps the three-tier \
    rating tables current, snapshots each market at its close, and serves the dashboard API")]
struct Args {
    /// Config file (optional; defaults apply when missing)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the SQLite database file
    #[arg(long)]
    db: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(db) = args.db.clone() {
        config.db_file = db;
    }
    if let Some(listen) = args.listen.clone() {
        config.listen_addr = listen;
    }
    init_logger(&config.log_filter);
    info!("args: {args:#?}");

    let config = Arc::new(config);
    let store = Store::open(&config.db_file).await?;

    if let Err(e) = migrate::migrate_from_json_if_needed(&store, Path::new(".")).await {
        error!("[Migrate] JSON migration failed: {e:#}");
    }

    let token = CancellationToken::new();
    let dr = Arc::new(DrClient::new(&config));
    let scanner: Arc<dyn QuoteFetcher> = Arc::new(ScannerClient::new(&config));

    let mut tasks = Vec::new();

    {
        let store = store.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = accuracy::backfill_on_startup(&store, &token).await {
                error!("[Accuracy] Startup back-fill failed: {e:#}");
            }
        }));
    }

    let updater = LiveUpdater::new(
        config.clone(),
        store.clone(),
        dr.clone(),
        scanner.clone(),
        token.clone(),
    );
    tasks.push(tokio::spawn(updater.run()));

    let ctx = Arc::new(SnapshotContext::new(config.clone(), dr, scanner));
    for market in ALL_MARKETS {
        tasks.push(tokio::spawn(run_market_scheduler(
            ctx.clone(),
            market,
            token.clone(),
        )));
    }

    let app = api::router(ApiState {
        config: config.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Listening on {}", config.listen_addr);

    let shutdown = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    token.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task panicked: {e}");
        }
    }
    store.close().await;
    info!("Shutdown complete");
    Ok(())
}
