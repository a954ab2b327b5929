//! Real-time projection of streamed amounts.
//!
//! A checkpoint is turned into a live number by [`compute_flowing_amount`]; a
//! [`FlowTicker`] recomputes it on a fixed interval so callers can render a
//! smoothly increasing balance without refetching.

use std::collections::HashMap;
use std::time::Duration;

use alloy::primitives::{I256, U256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::models::FlowCheckpoint;

/// Default display refresh period
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

// tokio::time::interval panics on a zero period
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Project `checkpoint` to `now_seconds`.
///
/// Elapsed time is clamped at zero (clock skew never extrapolates backwards) and
/// a negative rate drains the amount down to zero at most.
pub fn compute_flowing_amount(checkpoint: &FlowCheckpoint, now_seconds: u64) -> U256 {
    let rate = checkpoint.flow_rate_per_second;
    if rate == I256::ZERO {
        return checkpoint.amount_at_checkpoint;
    }

    let elapsed = now_seconds.saturating_sub(checkpoint.checkpoint_timestamp);
    let delta = rate.unsigned_abs().saturating_mul(U256::from(elapsed));

    if rate.is_negative() {
        checkpoint.amount_at_checkpoint.saturating_sub(delta)
    } else {
        checkpoint.amount_at_checkpoint.saturating_add(delta)
    }
}

/// Wall-clock source in unix seconds
pub trait Clock {
    fn now_secs(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

impl<F: Fn() -> u64> Clock for F {
    fn now_secs(&self) -> u64 {
        self()
    }
}

/// Handle to a running live-update timer. Disposing (or dropping) it stops the timer.
#[derive(Debug)]
pub struct FlowTicker {
    handle: Option<JoinHandle<()>>,
}

impl FlowTicker {
    /// Stop ticking. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for FlowTicker {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Recompute the projection of `checkpoint` every `interval` and hand it to `on_tick`.
///
/// The first tick fires immediately. Missed ticks are skipped rather than bursted,
/// so the cadence is best-effort. Must be called inside a tokio runtime.
pub fn start_live_updates<C, F>(
    checkpoint: FlowCheckpoint,
    interval: Duration,
    clock: C,
    mut on_tick: F,
) -> FlowTicker
where
    C: Clock + Send + 'static,
    F: FnMut(U256) + Send + 'static,
{
    let period = interval.max(MIN_TICK_INTERVAL);
    let handle = tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            on_tick(compute_flowing_amount(&checkpoint, clock.now_secs()));
        }
    });

    FlowTicker {
        handle: Some(handle),
    }
}

struct LiveFlow {
    ticker: FlowTicker,
    latest: watch::Receiver<U256>,
}

/// Live tickers keyed by flow id. Each refresh supersedes the previous ticker
/// for a flow wholesale (cancel old, start new).
pub struct FlowBoard<C = SystemClock> {
    interval: Duration,
    clock: C,
    flows: HashMap<String, LiveFlow>,
}

impl FlowBoard<SystemClock> {
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, SystemClock)
    }
}

impl<C> FlowBoard<C>
where
    C: Clock + Clone + Send + 'static,
{
    pub fn with_clock(interval: Duration, clock: C) -> Self {
        Self {
            interval,
            clock,
            flows: HashMap::new(),
        }
    }

    /// Start ticking `checkpoint` for `id`, disposing any ticker already running for it.
    /// Returns true when an older ticker was superseded.
    pub fn replace(&mut self, id: &str, checkpoint: FlowCheckpoint) -> bool {
        let superseded = match self.flows.remove(id) {
            Some(mut old) => {
                old.ticker.dispose();
                true
            }
            None => false,
        };

        let initial = compute_flowing_amount(&checkpoint, self.clock.now_secs());
        let (tx, rx) = watch::channel(initial);
        let ticker = start_live_updates(checkpoint, self.interval, self.clock.clone(), move |amount| {
            tx.send_replace(amount);
        });

        debug!("Live ticker {} for {}", if superseded { "restarted" } else { "started" }, id);
        self.flows.insert(id.to_string(), LiveFlow { ticker, latest: rx });
        superseded
    }

    /// Dispose tickers for flows that are no longer reported upstream,
    /// i.e. every id for which `keep` returns false
    pub fn retain<P: FnMut(&str) -> bool>(&mut self, mut keep: P) {
        self.flows.retain(|id, live| {
            if keep(id) {
                true
            } else {
                live.ticker.dispose();
                debug!("Live ticker stopped for {}", id);
                false
            }
        });
    }

    /// Most recent amount produced by the flow's ticker
    pub fn latest(&self, id: &str) -> Option<U256> {
        self.flows.get(id).map(|live| *live.latest.borrow())
    }

    /// Subscribe to ticks of one flow (closes when the flow is superseded or dropped)
    pub fn watch(&self, id: &str) -> Option<watch::Receiver<U256>> {
        self.flows.get(id).map(|live| live.latest.clone())
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn clear(&mut self) {
        for live in self.flows.values_mut() {
            live.ticker.dispose();
        }
        self.flows.clear();
    }
}
