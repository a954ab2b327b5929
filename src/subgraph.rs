// src/subgraph.rs
//! Polling client for a Superfluid-style subgraph. Every fetch produces a fresh
//! set of immutable checkpoints for one account.

use std::future::Future;
use std::time::Duration;

use alloy::primitives::{I256, U256};
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::models::{FlowCheckpoint, FlowKind, TrackedFlow};

/// Largest page the hosted subgraph serves
const PAGE_SIZE: usize = 1000;

// Each collection is read in `id` order, resuming after the last id seen.
const INFLOWS_QUERY: &str = r#"
query Inflows($account: String!, $lastId: String!, $first: Int!) {
  items: streams(where: { receiver: $account, id_gt: $lastId }, orderBy: id, orderDirection: asc, first: $first) {
    id
    currentFlowRate
    streamedUntilUpdatedAt
    updatedAtTimestamp
    token { id symbol }
    sender { id }
    receiver { id }
  }
}
"#;

const OUTFLOWS_QUERY: &str = r#"
query Outflows($account: String!, $lastId: String!, $first: Int!) {
  items: streams(where: { sender: $account, id_gt: $lastId }, orderBy: id, orderDirection: asc, first: $first) {
    id
    currentFlowRate
    streamedUntilUpdatedAt
    updatedAtTimestamp
    token { id symbol }
    sender { id }
    receiver { id }
  }
}
"#;

const SNAPSHOTS_QUERY: &str = r#"
query Snapshots($account: String!, $lastId: String!, $first: Int!) {
  items: accountTokenSnapshots(where: { account: $account, id_gt: $lastId }, orderBy: id, orderDirection: asc, first: $first) {
    id
    totalNetFlowRate
    balanceUntilUpdatedAt
    updatedAtTimestamp
    token { id symbol }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
}

/// Entity with a cursor id
trait Keyed {
    fn id(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct EntityRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenRef {
    id: String,
    #[serde(default)]
    symbol: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamEntity {
    id: String,
    current_flow_rate: String,
    streamed_until_updated_at: String,
    updated_at_timestamp: String,
    token: TokenRef,
    sender: EntityRef,
    receiver: EntityRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEntity {
    id: String,
    total_net_flow_rate: String,
    balance_until_updated_at: String,
    updated_at_timestamp: String,
    token: TokenRef,
}

impl Keyed for StreamEntity {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Keyed for SnapshotEntity {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone)]
pub struct SubgraphClient {
    client: Client,
    url: String,
}

impl SubgraphClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Fetch inbound streams, outbound streams and token balances of `account`
    pub async fn fetch_account_flows(&self, account: &str) -> Result<Vec<TrackedFlow>> {
        let account = account.to_lowercase();
        info!("📡 Querying subgraph for {}", account);

        let inflows = self.fetch_all(INFLOWS_QUERY, &account).await.wrap_err("inflows")?;
        let outflows = self.fetch_all(OUTFLOWS_QUERY, &account).await.wrap_err("outflows")?;
        let snapshots = self.fetch_all(SNAPSHOTS_QUERY, &account).await.wrap_err("snapshots")?;
        let flows = build_flows(inflows, outflows, snapshots)?;

        info!("📩 {} flows for {}", flows.len(), account);
        Ok(flows)
    }

    async fn fetch_all<T: DeserializeOwned + Keyed>(&self, query: &str, account: &str) -> Result<Vec<T>> {
        collect_pages(PAGE_SIZE, |last_id| self.fetch_page(query, account, last_id)).await
    }

    async fn fetch_page<T: DeserializeOwned>(&self, query: &str, account: &str, last_id: String) -> Result<Vec<T>> {
        let payload = json!({
            "query": query,
            "variables": { "account": account, "lastId": last_id, "first": PAGE_SIZE }
        });

        let resp = self.client.post(&self.url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(eyre!("Subgraph error: HTTP {}", resp.status()));
        }
        let text = resp.text().await?;
        parse_page(&text)
    }
}

/// Keep requesting pages after the last seen id until one comes back short
async fn collect_pages<T, F, Fut>(page_size: usize, mut fetch: F) -> Result<Vec<T>>
where
    T: Keyed,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let mut items: Vec<T> = Vec::new();
    let mut last_id = String::new();

    loop {
        let page = fetch(last_id.clone()).await?;
        let full = page.len() >= page_size;

        if let Some(last) = page.last() {
            if last.id() <= last_id.as_str() {
                return Err(eyre!("subgraph page did not advance past {:?}", last_id));
            }
            last_id = last.id().to_string();
        }
        items.extend(page);

        if !full {
            return Ok(items);
        }
        debug!("Page full, continuing after {}", last_id);
    }
}

fn parse_page<T: DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    let parsed: GraphQlResponse<Page<T>> =
        serde_json::from_str(text).wrap_err("malformed subgraph response")?;

    if !parsed.errors.is_empty() {
        let messages: Vec<_> = parsed.errors.into_iter().map(|e| e.message).collect();
        return Err(eyre!("Subgraph returned errors: {}", messages.join("; ")));
    }
    let data = parsed.data.ok_or_else(|| eyre!("Subgraph response has no data"))?;
    Ok(data.items)
}

fn build_flows(
    inflows: Vec<StreamEntity>,
    outflows: Vec<StreamEntity>,
    snapshots: Vec<SnapshotEntity>,
) -> Result<Vec<TrackedFlow>> {
    let mut flows = Vec::with_capacity(inflows.len() + outflows.len() + snapshots.len());

    for s in inflows {
        let counterparty = s.sender.id.clone();
        flows.push(stream_flow(s, FlowKind::Inflow, counterparty)?);
    }
    for s in outflows {
        let counterparty = s.receiver.id.clone();
        flows.push(stream_flow(s, FlowKind::Outflow, counterparty)?);
    }
    for snap in snapshots {
        let checkpoint = FlowCheckpoint::new(
            parse_amount(&snap.balance_until_updated_at)?,
            parse_timestamp(&snap.updated_at_timestamp)?,
            parse_rate(&snap.total_net_flow_rate)?,
        );
        flows.push(TrackedFlow {
            id: snap.id,
            kind: FlowKind::Balance,
            token: snap.token.id,
            token_symbol: snap.token.symbol,
            counterparty: None,
            checkpoint,
        });
    }

    Ok(flows)
}

fn stream_flow(s: StreamEntity, kind: FlowKind, counterparty: String) -> Result<TrackedFlow> {
    let checkpoint = FlowCheckpoint::new(
        parse_amount(&s.streamed_until_updated_at)?,
        parse_timestamp(&s.updated_at_timestamp)?,
        parse_rate(&s.current_flow_rate)?,
    );
    Ok(TrackedFlow {
        id: s.id,
        kind,
        token: s.token.id,
        token_symbol: s.token.symbol,
        counterparty: Some(counterparty),
        checkpoint,
    })
}

/// BigInt amount; a negative checkpoint amount is clamped to zero
fn parse_amount(s: &str) -> Result<U256> {
    let value = I256::from_dec_str(s.trim())
        .map_err(|e| eyre!("invalid amount {:?}: {}", s, e))?;
    if value.is_negative() {
        warn!("Negative checkpoint amount {} clamped to 0", s);
        return Ok(U256::ZERO);
    }
    Ok(value.unsigned_abs())
}

fn parse_rate(s: &str) -> Result<I256> {
    I256::from_dec_str(s.trim())
        .map_err(|e| eyre!("invalid flow rate {:?}: {}", s, e))
}

fn parse_timestamp(s: &str) -> Result<u64> {
    s.trim()
        .parse()
        .wrap_err_with(|| format!("invalid timestamp {:?}", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const INFLOWS: &str = r#"{
      "data": {
        "items": [{
          "id": "0xaaa-0xbbb-0xtoken-0",
          "currentFlowRate": "385802469135",
          "streamedUntilUpdatedAt": "1000000000000000000",
          "updatedAtTimestamp": "1700000000",
          "token": { "id": "0xtoken", "symbol": "ETHx" },
          "sender": { "id": "0xaaa" },
          "receiver": { "id": "0xbbb" }
        }]
      }
    }"#;

    const OUTFLOWS: &str = r#"{
      "data": {
        "items": [{
          "id": "0xbbb-0xccc-0xtoken-0",
          "currentFlowRate": "0",
          "streamedUntilUpdatedAt": "42",
          "updatedAtTimestamp": "1690000000",
          "token": { "id": "0xtoken", "symbol": "ETHx" },
          "sender": { "id": "0xbbb" },
          "receiver": { "id": "0xccc" }
        }]
      }
    }"#;

    const SNAPSHOTS: &str = r#"{
      "data": {
        "items": [{
          "id": "0xbbb-0xtoken",
          "totalNetFlowRate": "-1000",
          "balanceUntilUpdatedAt": "5000000",
          "updatedAtTimestamp": "1700000100",
          "token": { "id": "0xtoken", "symbol": "ETHx" }
        }]
      }
    }"#;

    fn build(inflows: &str) -> Result<Vec<TrackedFlow>> {
        build_flows(parse_page(inflows)?, parse_page(OUTFLOWS)?, parse_page(SNAPSHOTS)?)
    }

    #[test]
    fn parses_streams_and_snapshots() {
        let flows = build(INFLOWS).unwrap();
        assert_eq!(flows.len(), 3);

        let inflow = &flows[0];
        assert_eq!(inflow.kind, FlowKind::Inflow);
        assert_eq!(inflow.counterparty.as_deref(), Some("0xaaa"));
        assert_eq!(inflow.checkpoint.checkpoint_timestamp, 1_700_000_000);
        assert_eq!(inflow.checkpoint.amount_at_checkpoint, U256::from(1_000_000_000_000_000_000u64));

        let outflow = &flows[1];
        assert_eq!(outflow.kind, FlowKind::Outflow);
        assert_eq!(outflow.counterparty.as_deref(), Some("0xccc"));
        assert_eq!(outflow.checkpoint.flow_rate_per_second, I256::ZERO);

        let balance = &flows[2];
        assert_eq!(balance.kind, FlowKind::Balance);
        assert_eq!(balance.counterparty, None);
        assert!(balance.checkpoint.flow_rate_per_second.is_negative());
    }

    #[test]
    fn graphql_errors_fail_the_fetch() {
        let err = parse_page::<StreamEntity>(r#"{"errors":[{"message":"indexing_error"}]}"#).unwrap_err();
        assert!(err.to_string().contains("indexing_error"));
    }

    #[test]
    fn malformed_numbers_fail_the_fetch() {
        let bad = INFLOWS.replace("\"385802469135\"", "\"12.5\"");
        assert!(build(&bad).is_err());
    }

    #[test]
    fn negative_amount_clamps_to_zero() {
        assert_eq!(parse_amount("-15").unwrap(), U256::ZERO);
        assert_eq!(parse_amount("15").unwrap(), U256::from(15u64));
    }

    struct Item(String);

    impl Keyed for Item {
        fn id(&self) -> &str {
            &self.0
        }
    }

    /// Serves `ids` in pages of `size`, recording the cursor of every request
    async fn paged(ids: &[&str], size: usize) -> (Vec<String>, Vec<String>) {
        let cursors = RefCell::new(Vec::new());
        let items = collect_pages(size, |last_id: String| {
            cursors.borrow_mut().push(last_id.clone());
            let page: Vec<Item> = ids
                .iter()
                .filter(|id| **id > last_id.as_str())
                .take(size)
                .map(|id| Item(id.to_string()))
                .collect();
            async move { Ok(page) }
        })
        .await
        .unwrap();
        (items.into_iter().map(|i| i.0).collect(), cursors.into_inner())
    }

    #[tokio::test]
    async fn follows_full_pages_until_a_short_one() {
        let (items, cursors) = paged(&["a", "b", "c", "d", "e"], 2).await;
        assert_eq!(items, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(cursors, vec!["", "b", "d"]);
    }

    #[tokio::test]
    async fn exactly_full_last_page_ends_on_an_empty_one() {
        let (items, cursors) = paged(&["a", "b", "c", "d"], 2).await;
        assert_eq!(items.len(), 4);
        assert_eq!(cursors, vec!["", "b", "d"]);
    }

    #[tokio::test]
    async fn more_than_one_page_size_of_streams() {
        let ids: Vec<String> = (0..PAGE_SIZE + 250).map(|i| format!("0x{:06}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let (items, cursors) = paged(&refs, PAGE_SIZE).await;
        assert_eq!(items.len(), PAGE_SIZE + 250);
        assert_eq!(cursors.len(), 2);
    }

    #[tokio::test]
    async fn stuck_cursor_is_an_error() {
        let res = collect_pages(1, |_last_id: String| async { Ok(vec![Item("a".into())]) }).await;
        assert!(res.is_err());
    }
}
