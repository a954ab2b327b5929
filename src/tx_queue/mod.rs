//! Transaction Queue Subsystem
//!
//! Runs an ordered list of on-chain steps one at a time and exposes a single
//! progress state for the whole flow.
//!
//! ## Flow
//! 1. Build [`TransactionStep`]s (e.g. `RpcClient::broadcast_step`)
//! 2. `subscribe()` to the queue to render progress
//! 3. `execute_transactions` runs the steps in order and stops at the first failure
//! 4. To retry, run `state.remaining(&steps)` on the same queue
//!
//! Each flow owns its own [`TransactionQueue`]; there is no shared global queue.

mod types;
mod executor;

pub use types::{QueueState, QueueStatus, StepFuture, TransactionStep, TxError};
pub use executor::TransactionQueue;
