// src/models.rs
use alloy::primitives::{I256, U256};
use serde::Serialize;

/// Last known (amount, timestamp) pair plus the per-second rate projected from it.
/// Built fresh on every upstream refresh and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowCheckpoint {
    pub amount_at_checkpoint: U256,
    pub checkpoint_timestamp: u64,     // unix seconds
    pub flow_rate_per_second: I256,    // negative for draining balances
}

impl FlowCheckpoint {
    pub fn new(amount_at_checkpoint: U256, checkpoint_timestamp: u64, flow_rate_per_second: I256) -> Self {
        Self {
            amount_at_checkpoint,
            checkpoint_timestamp,
            flow_rate_per_second,
        }
    }
}

/// What a tracked flow measures for the watched account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Amount streamed to the account by one sender
    Inflow,
    /// Amount streamed from the account to one receiver
    Outflow,
    /// Account balance of a token under its total net flow rate
    Balance,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Inflow => "inflow",
            FlowKind::Outflow => "outflow",
            FlowKind::Balance => "balance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inflow" => Some(FlowKind::Inflow),
            "outflow" => Some(FlowKind::Outflow),
            "balance" => Some(FlowKind::Balance),
            _ => None,
        }
    }
}

/// A checkpoint together with the subgraph entity it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFlow {
    pub id: String,
    pub kind: FlowKind,
    pub token: String,
    pub token_symbol: String,
    pub counterparty: Option<String>,
    pub checkpoint: FlowCheckpoint,
}

/// Key of an account's flow on the live board. A stream id alone is shared by
/// its sender and receiver, so the account is part of the key.
pub fn live_key(account: &str, flow_id: &str) -> String {
    format!("{}:{}", account.to_lowercase(), flow_id)
}

/// Board key prefix covering every flow of `account`
pub fn live_key_prefix(account: &str) -> String {
    live_key(account, "")
}

/// API view of a flow projected to the request time
#[derive(Debug, Serialize)]
pub struct FlowView {
    pub id: String,
    pub kind: FlowKind,
    pub token: String,
    pub token_symbol: String,
    pub counterparty: Option<String>,
    pub amount_at_checkpoint: String, // base units as decimal string (safe for API)
    pub checkpoint_timestamp: u64,
    pub flow_rate: String,
    pub flow_rate_per_month: String,
    pub amount_now: String,
    pub amount_now_display: String,
    pub flow_rate_per_month_display: String,
    pub as_of: u64,
}

/// Latest value published by a live ticker
#[derive(Debug, Serialize)]
pub struct LiveAmount {
    pub id: String,
    pub amount: String,
    pub amount_display: String,
}
