//! Flow State core: live projection of streamed token balances and sequential
//! execution of multi-transaction on-chain flows.

pub mod api;
pub mod config;
pub mod db;
pub mod flowing;
pub mod format;
pub mod models;
pub mod poller;
pub mod rpc;
pub mod subgraph;
pub mod tx_queue;

pub use flowing::{compute_flowing_amount, start_live_updates, Clock, FlowBoard, FlowTicker, SystemClock};
pub use models::FlowCheckpoint;
pub use tx_queue::{QueueState, QueueStatus, TransactionQueue, TransactionStep, TxError};
