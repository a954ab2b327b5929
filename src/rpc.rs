// src/rpc.rs
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::tx_queue::{TransactionStep, TxError};

/// JSON-RPC error object (also the shape EIP-1193 providers reject with)
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcResponse<T> {
    // tried first: a missing `result` would otherwise read as null
    Error { error: RpcErrorObject },
    Success { result: T },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Receipt {
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,

    #[serde(rename = "blockNumber")]
    pub block_number_hex: String,

    /// "0x1" success, "0x0" reverted
    pub status: String,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status == "0x1"
    }
}

/// Minimal JSON-RPC client for broadcasting signed transactions
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
    receipt_poll: Duration,
    max_polls: u32,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, receipt_poll: Duration, max_polls: u32) -> eyre::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            receipt_poll,
            max_polls,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, TxError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        debug!("📡 Sending {} → {}", method, self.url);

        let resp = self.client.post(&self.url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(TxError::TransactionFailed(format!("RPC error: HTTP {}", resp.status())));
        }
        let text = resp.text().await?;
        parse_response(&text)
    }

    /// Submit a signed, RLP-encoded transaction. Returns the transaction hash.
    pub async fn send_raw_transaction(&self, raw_tx: &str) -> Result<String, TxError> {
        let raw = normalize_raw_tx(raw_tx)?;
        let hash: String = self.call("eth_sendRawTransaction", json!([raw])).await?;
        info!("Broadcast transaction {}", hash);
        Ok(hash)
    }

    /// Poll for the receipt until it is mined, reverted, or polls run out
    pub async fn wait_for_receipt(&self, tx_hash: &str) -> Result<Receipt, TxError> {
        for attempt in 1..=self.max_polls {
            let receipt: Option<Receipt> = self.call("eth_getTransactionReceipt", json!([tx_hash])).await?;

            match receipt {
                Some(r) if r.succeeded() => {
                    info!("Transaction {} confirmed in block {}", r.tx_hash, r.block_number_hex);
                    return Ok(r);
                }
                Some(r) => {
                    return Err(TxError::TransactionFailed(format!("transaction {} reverted", r.tx_hash)));
                }
                None => {
                    debug!("Receipt for {} not available yet (poll {})", tx_hash, attempt);
                    tokio::time::sleep(self.receipt_poll).await;
                }
            }
        }

        Err(TxError::TransactionFailed(format!(
            "timed out waiting for receipt of {} after {} polls",
            tx_hash, self.max_polls
        )))
    }

    /// A queue step that broadcasts `raw_tx` and resolves once it is confirmed
    pub fn broadcast_step(self: &Arc<Self>, raw_tx: String) -> TransactionStep {
        let rpc = Arc::clone(self);
        let raw_tx = Arc::new(raw_tx);
        TransactionStep::new(move || {
            let rpc = Arc::clone(&rpc);
            let raw_tx = Arc::clone(&raw_tx);
            async move {
                let hash = rpc.send_raw_transaction(&raw_tx).await?;
                rpc.wait_for_receipt(&hash).await.map(|_| ())
            }
        })
    }
}

fn parse_response<T: DeserializeOwned>(text: &str) -> Result<T, TxError> {
    let parsed: RpcResponse<T> = serde_json::from_str(text)
        .map_err(|e| TxError::Unknown(format!("unexpected RPC response: {}", e)))?;
    match parsed {
        RpcResponse::Success { result } => Ok(result),
        RpcResponse::Error { error } => Err(TxError::from_rpc_error(&error)),
    }
}

/// Validate hex and make sure the payload carries the 0x prefix
fn normalize_raw_tx(raw_tx: &str) -> Result<String, TxError> {
    let body = raw_tx.trim().trim_start_matches("0x");
    if body.is_empty() {
        return Err(TxError::Unknown("empty raw transaction".into()));
    }
    hex::decode(body).map_err(|e| TxError::Unknown(format!("raw transaction is not hex: {}", e)))?;
    Ok(format!("0x{}", body))
}
