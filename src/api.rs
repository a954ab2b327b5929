use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use rusqlite::Connection;
use tokio::task;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::flowing::{compute_flowing_amount, Clock, FlowBoard, SystemClock};
use crate::format::{flow_rate_per_month, format_signed_units, format_units};
use crate::models::{live_key, FlowView, LiveAmount, TrackedFlow};

type ApiError = (StatusCode, String);

#[derive(Clone)]
struct AppState {
    conn: Arc<Mutex<Connection>>,
    board: Arc<Mutex<FlowBoard>>,
    token_decimals: u8,
    display_decimals: u8,
}

#[derive(Deserialize)]
pub struct FlowsQuery {
    pub account: String,
}

pub fn router(cfg: &Config, conn: Arc<Mutex<Connection>>, board: Arc<Mutex<FlowBoard>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = AppState {
        conn,
        board,
        token_decimals: cfg.token_decimals,
        display_decimals: cfg.display_decimals,
    };

    Router::new()
        .route("/", get(|| async { "Flow State API running" }))
        .route("/flows", get(get_flows))
        .route("/flows/:id/live", get(get_live))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(cfg: Config, conn: Arc<Mutex<Connection>>, board: Arc<Mutex<FlowBoard>>) -> eyre::Result<()> {
    let app = router(&cfg, conn, board);

    let addr = SocketAddr::from(([127, 0, 0, 1], cfg.port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn get_flows(
    State(state): State<AppState>,
    Query(q): Query<FlowsQuery>,
) -> Result<Json<Vec<FlowView>>, ApiError> {
    let conn = Arc::clone(&state.conn);
    let account = q.account.clone();

    // ---------- DB read (spawn_blocking) ----------
    let flows = task::spawn_blocking(move || {
        let db = conn.lock().map_err(|_| eyre::eyre!("db mutex poisoned"))?;
        db::list_checkpoints(&db, &account)
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;

    let now = SystemClock.now_secs();
    let views = flows
        .iter()
        .map(|f| flow_view(f, now, state.token_decimals, state.display_decimals))
        .collect();
    Ok(Json(views))
}

async fn get_live(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<FlowsQuery>,
) -> Result<Json<LiveAmount>, ApiError> {
    let latest = state
        .board
        .lock()
        .map_err(|_| internal("board mutex poisoned"))?
        .latest(&live_key(&q.account, &id));

    match latest {
        Some(amount) => Ok(Json(LiveAmount {
            amount: amount.to_string(),
            amount_display: format_units(amount, state.token_decimals, state.display_decimals),
            id,
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("flow {} of {} is not live", id, q.account),
        )),
    }
}

/// Project a stored flow to `now` for rendering
pub fn flow_view(flow: &TrackedFlow, now: u64, decimals: u8, display_decimals: u8) -> FlowView {
    let cp = &flow.checkpoint;
    let amount_now = compute_flowing_amount(cp, now);
    let per_month = flow_rate_per_month(cp.flow_rate_per_second);

    FlowView {
        id: flow.id.clone(),
        kind: flow.kind,
        token: flow.token.clone(),
        token_symbol: flow.token_symbol.clone(),
        counterparty: flow.counterparty.clone(),
        amount_at_checkpoint: cp.amount_at_checkpoint.to_string(),
        checkpoint_timestamp: cp.checkpoint_timestamp,
        flow_rate: cp.flow_rate_per_second.to_string(),
        flow_rate_per_month: per_month.to_string(),
        amount_now: amount_now.to_string(),
        amount_now_display: format_units(amount_now, decimals, display_decimals),
        flow_rate_per_month_display: format_signed_units(per_month, decimals, display_decimals),
        as_of: now,
    }
}

fn internal<E: std::fmt::Display>(e: E) -> ApiError {
    error!("API error: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
