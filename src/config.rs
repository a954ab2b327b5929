use dotenvy::dotenv;
use eyre::Result;
use std::{env, str::FromStr, time::Duration};
use alloy::primitives::Address;
use tracing::{info, warn};

use crate::flowing::DEFAULT_TICK_INTERVAL;

#[derive(Debug, Clone)]
pub struct Config {
    pub subgraph_url: String,
    pub rpc_http_url: String,
    pub db_path: String,
    pub port: u16,
    pub accounts: Vec<String>,      // lowercase 0x addresses, as the subgraph indexes them
    pub poll_interval: Duration,
    pub tick_interval: Duration,
    pub token_decimals: u8,
    pub display_decimals: u8,
    pub receipt_poll: Duration,
    pub receipt_max_polls: u32,
}

pub fn load() -> Result<Config> {
    dotenv().ok(); // load from .env file if present

    let subgraph_url = env::var("SUBGRAPH_URL").unwrap_or_else(|_| {
        "https://subgraph-endpoints.superfluid.dev/optimism-mainnet/protocol-v1".to_string()
    });

    let rpc_http_url = env::var("RPC_HTTP_URL")
        .or_else(|_| env::var("RPC_URL")) // alias support
        .unwrap_or_else(|_| "https://mainnet.optimism.io".to_string());

    let db_path = env::var("DATABASE_URL").unwrap_or_else(|_| "flowstate.db".to_string());

    let accounts = parse_accounts(&env::var("ACCOUNTS").unwrap_or_default());
    if accounts.is_empty() {
        warn!("ACCOUNTS is empty; the poller will have nothing to track");
    }

    let cfg = Config {
        subgraph_url,
        rpc_http_url,
        db_path,
        port: env_or("PORT", 8080),
        accounts,
        poll_interval: Duration::from_secs(env_or("POLL_INTERVAL_SECS", 10)),
        tick_interval: env::var("TICK_INTERVAL_MS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TICK_INTERVAL),
        token_decimals: env_or("TOKEN_DECIMALS", 18),
        display_decimals: env_or("DISPLAY_DECIMALS", 6),
        receipt_poll: Duration::from_millis(env_or("RECEIPT_POLL_MS", 1000)),
        receipt_max_polls: env_or("RECEIPT_MAX_POLLS", 120),
    };

    info!("Loaded config: {:?}", cfg);

    Ok(cfg)
}

/// Numeric env var with a default when missing or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Comma-separated addresses; invalid entries are skipped with a warning, duplicates dropped
pub fn parse_accounts(raw: &str) -> Vec<String> {
    let mut accounts: Vec<String> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match part.parse::<Address>() {
            Ok(addr) => {
                let normalized = addr.to_string().to_lowercase();
                if !accounts.contains(&normalized) {
                    accounts.push(normalized);
                }
            }
            Err(e) => warn!("Skipping invalid account {:?}: {}", part, e),
        }
    }
    accounts
}
