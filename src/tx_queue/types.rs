//! Transaction queue data types

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;

use crate::rpc::RpcErrorObject;

/// EIP-1193 "user rejected request"
const USER_REJECTED_CODE: i64 = 4001;

/// Status of a queue run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueStatus {
    /// No run started yet
    #[default]
    Idle,
    /// Steps are being executed
    Running,
    /// Every step confirmed
    Completed,
    /// A step failed; the rest were skipped
    Failed,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::Idle => write!(f, "idle"),
            QueueStatus::Running => write!(f, "running"),
            QueueStatus::Completed => write!(f, "completed"),
            QueueStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a transaction step failed. Built where the raw error is first caught.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    /// The signer declined the request
    #[error("Transaction rejected")]
    UserRejected,
    /// Submitted but reverted, or the RPC/network call failed
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),
    #[error("Transaction error: {0}")]
    Unknown(String),
}

impl TxError {
    /// Classify a JSON-RPC / EIP-1193 error object
    pub fn from_rpc_error(err: &RpcErrorObject) -> Self {
        let message = err.message.to_lowercase();
        if err.code == USER_REJECTED_CODE
            || message.contains("user rejected")
            || message.contains("user denied")
            || message.contains("action_rejected")
        {
            return TxError::UserRejected;
        }

        match err.code {
            // JSON-RPC parse/request/method/params/internal errors
            -32700 | -32603..=-32600 => TxError::TransactionFailed(err.message.clone()),
            // server errors: reverted, nonce too low, underpriced...
            -32099..=-32000 => TxError::TransactionFailed(err.message.clone()),
            // geth "execution reverted"
            3 => TxError::TransactionFailed(err.message.clone()),
            // EIP-1193 unauthorized / unsupported / disconnected
            4100 | 4200 | 4900 | 4901 => TxError::TransactionFailed(err.message.clone()),
            _ => TxError::Unknown(err.message.clone()),
        }
    }

    pub fn is_user_rejection(&self) -> bool {
        matches!(self, TxError::UserRejected)
    }
}

impl From<reqwest::Error> for TxError {
    fn from(err: reqwest::Error) -> Self {
        TxError::TransactionFailed(format!("network error: {}", err))
    }
}

/// Observable progress of a queue
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueState {
    pub status: QueueStatus,
    /// Steps confirmed so far in the current run
    pub completed_count: usize,
    /// Set only when `status == Failed`
    pub last_error: Option<TxError>,
}

impl QueueState {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, QueueStatus::Completed | QueueStatus::Failed)
    }

    /// The suffix of `steps` that has not completed yet, for "retry from here"
    pub fn remaining<'a, T>(&self, steps: &'a [T]) -> &'a [T] {
        &steps[self.completed_count.min(steps.len())..]
    }
}

pub type StepFuture = BoxFuture<'static, Result<(), TxError>>;

/// One on-chain action. Resolves once the transaction is confirmed.
/// Cloneable and re-invocable so a failed suffix can be retried.
#[derive(Clone)]
pub struct TransactionStep(Arc<dyn Fn() -> StepFuture + Send + Sync>);

impl TransactionStep {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TxError>> + Send + 'static,
    {
        Self(Arc::new(move || f().boxed()))
    }

    pub fn run(&self) -> StepFuture {
        (self.0)()
    }
}

impl fmt::Debug for TransactionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransactionStep")
    }
}
