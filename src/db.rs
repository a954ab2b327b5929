use std::collections::HashSet;

use alloy::primitives::{I256, U256};
use eyre::{eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{FlowCheckpoint, FlowKind, TrackedFlow};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
  account              TEXT NOT NULL,
  flow_id              TEXT NOT NULL,
  kind                 TEXT NOT NULL CHECK (kind IN ('inflow','outflow','balance')),
  token_address        TEXT NOT NULL,
  token_symbol         TEXT NOT NULL,
  counterparty         TEXT,
  amount               TEXT NOT NULL, -- U256 stored as decimal string
  flow_rate            TEXT NOT NULL, -- I256 stored as decimal string
  checkpoint_timestamp INTEGER NOT NULL,
  updated_at           TEXT NOT NULL DEFAULT (datetime('now')),
  -- one stream is an outflow of its sender and an inflow of its receiver
  PRIMARY KEY (account, flow_id)
);
"#;

const SELECT_COLUMNS: &str = "flow_id, kind, token_address, token_symbol, counterparty, amount, flow_rate, checkpoint_timestamp";

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

/// Insert or replace the latest checkpoint of a flow
pub fn upsert_checkpoint(conn: &Connection, account: &str, flow: &TrackedFlow) -> Result<()> {
    let timestamp = i64::try_from(flow.checkpoint.checkpoint_timestamp)?;
    conn.execute(
        r#"
        INSERT INTO checkpoints (
            flow_id, account, kind, token_address, token_symbol, counterparty,
            amount, flow_rate, checkpoint_timestamp, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
        ON CONFLICT(account, flow_id) DO UPDATE SET
            kind                 = excluded.kind,
            token_symbol         = excluded.token_symbol,
            counterparty         = excluded.counterparty,
            amount               = excluded.amount,
            flow_rate            = excluded.flow_rate,
            checkpoint_timestamp = excluded.checkpoint_timestamp,
            updated_at           = excluded.updated_at
        "#,
        params![
            flow.id,
            account.to_lowercase(),
            flow.kind.as_str(),
            flow.token,
            flow.token_symbol,
            flow.counterparty,
            flow.checkpoint.amount_at_checkpoint.to_string(),
            flow.checkpoint.flow_rate_per_second.to_string(),
            timestamp,
        ],
    )?;
    Ok(())
}

/// All stored flows of an account
pub fn list_checkpoints(conn: &Connection, account: &str) -> Result<Vec<TrackedFlow>> {
    let sql = format!(
        "SELECT {} FROM checkpoints WHERE account = LOWER(?1) ORDER BY kind, flow_id",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([account], read_row)?;

    let mut flows = Vec::new();
    for row in rows {
        flows.push(into_flow(row?)?);
    }
    Ok(flows)
}

pub fn get_checkpoint(conn: &Connection, account: &str, flow_id: &str) -> Result<Option<TrackedFlow>> {
    let sql = format!(
        "SELECT {} FROM checkpoints WHERE account = LOWER(?1) AND flow_id = ?2",
        SELECT_COLUMNS
    );
    let raw = conn.query_row(&sql, [account, flow_id], read_row).optional()?;
    raw.map(into_flow).transpose()
}

/// Remove flows of `account` that the latest refresh no longer reported.
/// Returns the number of deleted rows.
pub fn delete_missing(conn: &Connection, account: &str, keep: &HashSet<String>) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT flow_id FROM checkpoints WHERE account = LOWER(?1)")?;
    let stored: Vec<String> = stmt
        .query_map([account], |r| r.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut deleted = 0;
    for id in stored.iter().filter(|id| !keep.contains(*id)) {
        deleted += conn.execute(
            "DELETE FROM checkpoints WHERE account = LOWER(?1) AND flow_id = ?2",
            [account, id.as_str()],
        )?;
    }
    Ok(deleted)
}

struct RawRow {
    flow_id: String,
    kind: String,
    token: String,
    token_symbol: String,
    counterparty: Option<String>,
    amount: String,
    flow_rate: String,
    checkpoint_timestamp: i64,
}

fn read_row(r: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        flow_id: r.get(0)?,
        kind: r.get(1)?,
        token: r.get(2)?,
        token_symbol: r.get(3)?,
        counterparty: r.get(4)?,
        amount: r.get(5)?,
        flow_rate: r.get(6)?,
        checkpoint_timestamp: r.get(7)?,
    })
}

fn into_flow(raw: RawRow) -> Result<TrackedFlow> {
    let kind = FlowKind::parse(&raw.kind).ok_or_else(|| eyre!("unknown flow kind {:?}", raw.kind))?;
    let amount = U256::from_str_radix(&raw.amount, 10)
        .map_err(|e| eyre!("corrupt amount for {}: {}", raw.flow_id, e))?;
    let rate = I256::from_dec_str(&raw.flow_rate)
        .map_err(|e| eyre!("corrupt flow rate for {}: {}", raw.flow_id, e))?;

    Ok(TrackedFlow {
        id: raw.flow_id,
        kind,
        token: raw.token,
        token_symbol: raw.token_symbol,
        counterparty: raw.counterparty,
        checkpoint: FlowCheckpoint::new(amount, u64::try_from(raw.checkpoint_timestamp)?, rate),
    })
}
