use std::sync::{Arc, Mutex};

use flow_state::{api, config, db, poller, FlowBoard};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // INFO by default, RUST_LOG overrides (e.g. RUST_LOG=flow_state=debug for ticker logs)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("Flow State starting...");

    // Load configuration
    let cfg = config::load()?;
    info!("  Subgraph: {}", cfg.subgraph_url);
    info!("  DB Path: {}", cfg.db_path);
    info!("  Port: {}", cfg.port);
    info!("  Accounts tracked: {:?}", cfg.accounts);

    // Run DB migrations once at startup
    {
        let conn = db::connect(&cfg.db_path)?;
        db::run_migrations(&conn)?;
    }

    // Shared DB connection and live tickers
    let shared_conn = Arc::new(Mutex::new(db::connect(&cfg.db_path)?));
    let board = Arc::new(Mutex::new(FlowBoard::new(cfg.tick_interval)));

    // Spawn API task
    let api_handle = tokio::spawn({
        let cfg = cfg.clone();
        let conn = Arc::clone(&shared_conn);
        let board = Arc::clone(&board);
        async move { api::serve(cfg, conn, board).await }
    });

    // Spawn poller task
    let poller_handle = tokio::spawn({
        let cfg = cfg.clone();
        let conn = Arc::clone(&shared_conn);
        let board = Arc::clone(&board);
        async move { poller::run(cfg, conn, board).await }
    });

    // Graceful shutdown
    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = poller_handle => match res {
            Ok(Ok(_)) => info!("Poller exited cleanly"),
            Ok(Err(e)) => error!("Poller error: {:?}", e),
            Err(e) => error!("Poller task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    // stop every live ticker before the runtime goes away
    if let Ok(mut board) = board.lock() {
        board.clear();
    }

    info!("Flow State stopped.");
    Ok(())
}
