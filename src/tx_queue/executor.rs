//! Sequential transaction executor
//!
//! Progress lives in a `watch` channel owned by the queue; observers hold receivers.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::types::{QueueState, QueueStatus, TransactionStep, TxError};

/// Runs transaction steps strictly in order, stopping at the first failure
pub struct TransactionQueue {
    state: watch::Sender<QueueState>,
}

impl Default for TransactionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionQueue {
    pub fn new() -> Self {
        let (state, _) = watch::channel(QueueState::default());
        Self { state }
    }

    /// Receiver for progress updates (status, completed count, last error)
    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.state.subscribe()
    }

    /// Snapshot of the current state
    pub fn state(&self) -> QueueState {
        self.state.borrow().clone()
    }

    /// Execute `steps` one after another. Step `i + 1` is only invoked once step
    /// `i` resolved. The first error fails the run, is stored as `last_error` and
    /// returned; later steps are never invoked. No retries happen here.
    /// A panicking step fails the run like any other error.
    ///
    /// Taking `&mut self` keeps a second run on the same queue from overlapping.
    pub async fn execute_transactions(&mut self, steps: &[TransactionStep]) -> Result<(), TxError> {
        self.state.send_replace(QueueState::default());
        self.state.send_modify(|s| s.status = QueueStatus::Running);

        info!("[TxQueue] Executing {} transaction step(s)", steps.len());

        for (index, step) in steps.iter().enumerate() {
            debug!("[TxQueue] Step {}/{} started", index + 1, steps.len());

            let outcome = AssertUnwindSafe(async { step.run().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let err = TxError::Unknown(format!("step panicked: {}", panic_message(&*panic)));
                    error!("[TxQueue] Step {}/{} panicked", index + 1, steps.len());
                    Err(err)
                });

            if let Err(err) = outcome {
                warn!("[TxQueue] Step {}/{} failed: {}", index + 1, steps.len(), err);
                self.state.send_modify(|s| {
                    s.status = QueueStatus::Failed;
                    s.last_error = Some(err.clone());
                });
                return Err(err);
            }

            self.state.send_modify(|s| s.completed_count += 1);
            info!("[TxQueue] Step {}/{} confirmed", index + 1, steps.len());
        }

        self.state.send_modify(|s| s.status = QueueStatus::Completed);
        info!("[TxQueue] All {} step(s) completed", steps.len());
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcErrorObject;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn ok_step(log: &Log, name: &'static str) -> TransactionStep {
        let log = Arc::clone(log);
        TransactionStep::new(move || {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            }
        })
    }

    fn failing_step(log: &Log, name: &'static str, err: TxError) -> TransactionStep {
        let log = Arc::clone(log);
        TransactionStep::new(move || {
            let log = Arc::clone(&log);
            let err = err.clone();
            async move {
                log.lock().unwrap().push(name.to_string());
                Err(err)
            }
        })
    }

    #[tokio::test]
    async fn empty_queue_completes_immediately() {
        let mut queue = TransactionQueue::new();
        assert_eq!(queue.state().status, QueueStatus::Idle);

        queue.execute_transactions(&[]).await.unwrap();

        let state = queue.state();
        assert_eq!(state.status, QueueStatus::Completed);
        assert_eq!(state.completed_count, 0);
        assert_eq!(state.last_error, None);
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_reports_progress() {
        let mut queue = TransactionQueue::new();
        let observer = queue.subscribe();
        let seen: Arc<Mutex<Vec<QueueState>>> = Arc::new(Mutex::new(Vec::new()));
        let order: Log = Arc::new(Mutex::new(Vec::new()));

        seen.lock().unwrap().push(queue.state());

        let first = {
            let (observer, seen, order) = (observer.clone(), Arc::clone(&seen), Arc::clone(&order));
            TransactionStep::new(move || {
                let (observer, seen, order) = (observer.clone(), Arc::clone(&seen), Arc::clone(&order));
                async move {
                    seen.lock().unwrap().push(observer.borrow().clone());
                    order.lock().unwrap().push("s1 start".into());
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    order.lock().unwrap().push("s1 done".into());
                    Ok(())
                }
            })
        };
        let second = {
            let (observer, seen, order) = (observer.clone(), Arc::clone(&seen), Arc::clone(&order));
            TransactionStep::new(move || {
                let (observer, seen, order) = (observer.clone(), Arc::clone(&seen), Arc::clone(&order));
                async move {
                    seen.lock().unwrap().push(observer.borrow().clone());
                    order.lock().unwrap().push("s2 start".into());
                    Ok(())
                }
            })
        };

        queue.execute_transactions(&[first, second]).await.unwrap();
        seen.lock().unwrap().push(queue.state());

        let seen = seen.lock().unwrap();
        let statuses: Vec<_> = seen.iter().map(|s| s.status).collect();
        let counts: Vec<_> = seen.iter().map(|s| s.completed_count).collect();
        assert_eq!(
            statuses,
            vec![QueueStatus::Idle, QueueStatus::Running, QueueStatus::Running, QueueStatus::Completed]
        );
        assert_eq!(counts, vec![0, 0, 1, 2]);
        assert_eq!(*order.lock().unwrap(), vec!["s1 start", "s1 done", "s2 start"]);
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let mut queue = TransactionQueue::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let steps = vec![
            ok_step(&log, "s1"),
            failing_step(&log, "s2", TxError::TransactionFailed("execution reverted".into())),
            ok_step(&log, "s3"),
        ];

        let err = queue.execute_transactions(&steps).await.unwrap_err();

        assert_eq!(err, TxError::TransactionFailed("execution reverted".into()));
        let state = queue.state();
        assert_eq!(state.status, QueueStatus::Failed);
        assert_eq!(state.completed_count, 1);
        assert_eq!(state.last_error, Some(err));
        assert_eq!(*log.lock().unwrap(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn user_rejection_after_slow_first_step() {
        let mut queue = TransactionQueue::new();
        let slow = TransactionStep::new(|| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        let rejected = TransactionStep::new(|| async {
            Err(TxError::from_rpc_error(&RpcErrorObject {
                code: 4001,
                message: "User rejected the request.".into(),
                data: None,
            }))
        });

        let result = queue.execute_transactions(&[slow, rejected]).await;

        assert!(result.is_err());
        let state = queue.state();
        assert_eq!(state.status, QueueStatus::Failed);
        assert_eq!(state.completed_count, 1);
        assert_eq!(state.last_error.map(|e| e.to_string()).as_deref(), Some("Transaction rejected"));
    }

    #[tokio::test]
    async fn panicking_step_fails_the_run() {
        let mut queue = TransactionQueue::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        fn sign() -> Result<(), TxError> {
            panic!("signer went away")
        }
        let boom = TransactionStep::new(|| async { sign() });
        let steps = vec![ok_step(&log, "s1"), boom, ok_step(&log, "s3")];

        let err = queue.execute_transactions(&steps).await.unwrap_err();

        assert_eq!(err, TxError::Unknown("step panicked: signer went away".into()));
        let state = queue.state();
        assert_eq!(state.status, QueueStatus::Failed);
        assert_eq!(state.completed_count, 1);
        assert_eq!(state.last_error, Some(err));
        assert_eq!(*log.lock().unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn retry_from_remaining_suffix_resets_state() {
        let mut queue = TransactionQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fail_once = Arc::new(AtomicBool::new(true));

        let counted = {
            let calls = Arc::clone(&calls);
            TransactionStep::new(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let flaky = {
            let fail_once = Arc::clone(&fail_once);
            TransactionStep::new(move || {
                let fail_once = Arc::clone(&fail_once);
                async move {
                    if fail_once.swap(false, Ordering::SeqCst) {
                        Err(TxError::TransactionFailed("nonce too low".into()))
                    } else {
                        Ok(())
                    }
                }
            })
        };
        let steps = vec![counted.clone(), flaky, counted];

        assert!(queue.execute_transactions(&steps).await.is_err());
        let failed = queue.state();
        assert_eq!(failed.completed_count, 1);

        let remaining = failed.remaining(&steps);
        assert_eq!(remaining.len(), 2);
        queue.execute_transactions(remaining).await.unwrap();

        let state = queue.state();
        assert_eq!(state.status, QueueStatus::Completed);
        assert_eq!(state.completed_count, 2);
        assert_eq!(state.last_error, None);
        // the first step is not repeated by the retry
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
