//! Broadcast signed raw transactions one after another, stopping at the first failure.
//!
//! Usage: send_batch <raw_tx_hex> [<raw_tx_hex> ...]

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use flow_state::{config, rpc::RpcClient, QueueStatus, TransactionQueue, TransactionStep};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let raw_txs: Vec<String> = std::env::args().skip(1).collect();
    if raw_txs.is_empty() {
        bail!("usage: send_batch <raw_tx_hex> [<raw_tx_hex> ...]");
    }

    let cfg = config::load().map_err(|e| anyhow::anyhow!("{e}"))?;
    let rpc = Arc::new(
        RpcClient::new(&cfg.rpc_http_url, cfg.receipt_poll, cfg.receipt_max_polls)
            .map_err(|e| anyhow::anyhow!("{e}"))?,
    );

    let steps: Vec<TransactionStep> = raw_txs.into_iter().map(|raw| rpc.broadcast_step(raw)).collect();
    let total = steps.len();

    let mut queue = TransactionQueue::new();
    let mut progress = queue.subscribe();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let state = progress.borrow_and_update().clone();
            println!("[{}] {}/{} confirmed", state.status, state.completed_count, total);
        }
    });

    let result = queue.execute_transactions(&steps).await;
    let state = queue.state();
    drop(queue);
    join_reporter(reporter).await;

    match state.status {
        QueueStatus::Completed => {
            info!("All {} transactions confirmed", total);
            Ok(())
        }
        _ => {
            let remaining = state.remaining(&steps).len();
            result.with_context(|| format!("{} of {} transactions not confirmed", remaining, total))
        }
    }
}

/// Wait for the progress printer; a panicked or cancelled reporter is logged, not fatal
async fn join_reporter(reporter: JoinHandle<()>) -> bool {
    match reporter.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Progress reporter failed: {}", e);
            false
        }
    }
}
