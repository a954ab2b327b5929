use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use eyre::{eyre, Result};
use rusqlite::{Connection, Transaction};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::flowing::{Clock, FlowBoard};
use crate::models::{live_key, live_key_prefix, TrackedFlow};
use crate::subgraph::SubgraphClient;

const BASE_RETRY_SECS: u64 = 10;
const MAX_RETRY_SECS: u64 = 120;

/// Refresh checkpoints for every configured account forever.
/// Each refresh stores the new checkpoints and supersedes the live tickers.
pub async fn run(cfg: Config, conn: Arc<Mutex<Connection>>, board: Arc<Mutex<FlowBoard>>) -> Result<()> {
    let subgraph = SubgraphClient::new(&cfg.subgraph_url)?;
    let mut retry_delay = BASE_RETRY_SECS;

    info!(
        "Poller started for {} account(s), refresh every {:?}",
        cfg.accounts.len(),
        cfg.poll_interval
    );

    loop {
        let mut failed = false;

        for account in &cfg.accounts {
            match subgraph.fetch_account_flows(account).await {
                Ok(flows) => match apply_refresh(conn.as_ref(), board.as_ref(), account, &flows) {
                    Ok(deleted) => {
                        info!("Refreshed {} flows for {} ({} removed)", flows.len(), account, deleted);
                    }
                    Err(e) => {
                        error!("Storing checkpoints for {} failed: {:?}", account, e);
                        failed = true;
                    }
                },
                Err(e) => {
                    warn!("Subgraph fetch failed for {}: {:?}", account, e);
                    failed = true;
                }
            }
        }

        let pause = if failed {
            let pause = Duration::from_secs(retry_delay);
            retry_delay = (retry_delay * 2).min(MAX_RETRY_SECS);
            warn!("Refresh incomplete, retrying in {:?}", pause);
            pause
        } else {
            retry_delay = BASE_RETRY_SECS;
            cfg.poll_interval
        };

        sleep(pause).await;
    }
}

/// Persist one account's refresh and restart its tickers. Tickers of this
/// account's vanished flows are stopped; other accounts are left alone, so a
/// failed account keeps ticking on its last checkpoint.
/// Returns the number of stored flows that disappeared upstream.
pub fn apply_refresh<C>(
    conn: &Mutex<Connection>,
    board: &Mutex<FlowBoard<C>>,
    account: &str,
    flows: &[TrackedFlow],
) -> Result<usize>
where
    C: Clock + Clone + Send + 'static,
{
    let keep: HashSet<String> = flows.iter().map(|f| f.id.clone()).collect();

    let deleted = {
        let mut db = lock(conn)?;
        let tx: Transaction = db.transaction()?;
        for flow in flows {
            db::upsert_checkpoint(&tx, account, flow)?;
        }
        let deleted = db::delete_missing(&tx, account, &keep)?;
        tx.commit()?;
        deleted
    };

    let prefix = live_key_prefix(account);
    let live: HashSet<String> = flows.iter().map(|f| live_key(account, &f.id)).collect();

    let mut board = lock(board)?;
    board.retain(|key| !key.starts_with(&prefix) || live.contains(key));
    for flow in flows {
        board.replace(&live_key(account, &flow.id), flow.checkpoint);
    }

    Ok(deleted)
}

fn lock<T>(m: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    m.lock().map_err(|_| eyre!("mutex poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FlowCheckpoint, FlowKind};
    use alloy::primitives::{I256, U256};

    fn flow(id: &str, amount: u64) -> TrackedFlow {
        TrackedFlow {
            id: id.to_string(),
            kind: FlowKind::Inflow,
            token: "0xtoken".into(),
            token_symbol: "DAIx".into(),
            counterparty: Some("0xpeer".into()),
            checkpoint: FlowCheckpoint::new(U256::from(amount), 100, I256::from_dec_str("2").unwrap()),
        }
    }

    fn setup() -> (Mutex<Connection>, Mutex<FlowBoard<impl Clock + Clone + Send + 'static>>) {
        let conn = Connection::open_in_memory().unwrap();
        db::run_migrations(&conn).unwrap();
        let board = FlowBoard::with_clock(Duration::from_millis(100), || 110u64);
        (Mutex::new(conn), Mutex::new(board))
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_stores_checkpoints_and_restarts_tickers() {
        let (conn, board) = setup();

        let deleted = apply_refresh(&conn, &board, "0xabc", &[flow("a", 10), flow("b", 20)]).unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(board.lock().unwrap().latest("0xabc:a"), Some(U256::from(30u64)));

        let deleted = apply_refresh(&conn, &board, "0xabc", &[flow("b", 50)]).unwrap();
        assert_eq!(deleted, 1);

        let stored = db::list_checkpoints(&conn.lock().unwrap(), "0xabc").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].checkpoint.amount_at_checkpoint, U256::from(50u64));
        assert_eq!(board.lock().unwrap().latest("0xabc:b"), Some(U256::from(70u64)));
        assert_eq!(board.lock().unwrap().latest("0xabc:a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sender_and_receiver_keep_their_own_copy_of_a_stream() {
        let (conn, board) = setup();
        let mut outflow = flow("0xa-0xb-0xt-0", 10);
        outflow.kind = FlowKind::Outflow;
        let inflow = flow("0xa-0xb-0xt-0", 0);

        apply_refresh(&conn, &board, "0xa", &[outflow.clone()]).unwrap();
        apply_refresh(&conn, &board, "0xb", &[inflow.clone()]).unwrap();

        let db = conn.lock().unwrap();
        assert_eq!(db::list_checkpoints(&db, "0xa").unwrap(), vec![outflow]);
        assert_eq!(db::list_checkpoints(&db, "0xb").unwrap(), vec![inflow]);

        let board = board.lock().unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board.latest("0xa:0xa-0xb-0xt-0"), Some(U256::from(30u64)));
        assert_eq!(board.latest("0xb:0xa-0xb-0xt-0"), Some(U256::from(20u64)));
    }

    #[tokio::test(start_paused = true)]
    async fn pruning_is_scoped_to_the_refreshed_account() {
        let (conn, board) = setup();
        apply_refresh(&conn, &board, "0xa", &[flow("a1", 1), flow("a2", 1)]).unwrap();
        apply_refresh(&conn, &board, "0xb", &[flow("b1", 1)]).unwrap();

        // 0xb fails this round; 0xa loses a2
        apply_refresh(&conn, &board, "0xa", &[flow("a1", 1)]).unwrap();

        let board = board.lock().unwrap();
        assert_eq!(board.latest("0xa:a2"), None);
        assert!(board.latest("0xa:a1").is_some());
        assert!(board.latest("0xb:b1").is_some());
        assert_eq!(board.len(), 2);
    }
}
