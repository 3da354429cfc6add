//! Bounded worker pool shared across all agents.
//!
//! A fixed number of slots caps total concurrent LLM-driven work
//! system-wide, independent of agent count. Submission never blocks: a
//! saturated pool simply declines and the event waits in its queue for the
//! next tick. Results come back through a oneshot channel, so harvesting
//! is a non-blocking poll, not a sleep loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};

use muster_core::error::{MusterError, Result};
use muster_core::traits::ExecutionOutcome;

/// Handle to one in-flight execution.
pub struct ExecutionHandle {
    rx: oneshot::Receiver<Result<ExecutionOutcome>>,
}

impl ExecutionHandle {
    /// Non-blocking check for completion. `None` = still running.
    /// A dropped/panicked job surfaces as an executor error.
    pub fn try_harvest(&mut self) -> Option<Result<ExecutionOutcome>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(MusterError::Executor("execution task dropped".into())))
            }
        }
    }
}

/// Fixed-size bounded worker pool.
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    slots: usize,
    /// Hard deadline per job. `None` = wait forever (a hung executor then
    /// parks its agent Busy until restart).
    job_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(slots: usize, job_timeout: Option<Duration>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(slots)),
            slots,
            job_timeout,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Submit a job if a slot is free. `None` = pool saturated, try next
    /// tick. The permit is held for the job's whole lifetime.
    pub fn try_submit<F>(&self, job: F) -> Option<ExecutionHandle>
    where
        F: Future<Output = Result<ExecutionOutcome>> + Send + 'static,
    {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        let (tx, rx) = oneshot::channel();
        let timeout = self.job_timeout;

        tokio::spawn(async move {
            let result = match timeout {
                Some(deadline) => match tokio::time::timeout(deadline, job).await {
                    Ok(result) => result,
                    Err(_) => Err(MusterError::Executor(format!(
                        "execution exceeded {}s deadline",
                        deadline.as_secs()
                    ))),
                },
                None => job.await,
            };
            drop(permit);
            // Receiver gone = runtime shut down mid-flight; nothing to do.
            let _ = tx.send(result);
        });

        Some(ExecutionHandle { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn submit_and_harvest() {
        let pool = Dispatcher::new(2, None);
        let mut handle = pool
            .try_submit(async { Ok(ExecutionOutcome::completed("ok")) })
            .unwrap();
        settle().await;
        let outcome = handle.try_harvest().unwrap().unwrap();
        assert_eq!(outcome.output.as_deref(), Some("ok"));
        assert_eq!(pool.available_slots(), 2);
    }

    #[tokio::test]
    async fn saturated_pool_declines_without_blocking() {
        let pool = Dispatcher::new(1, None);
        let (_block_tx, block_rx) = oneshot::channel::<()>();
        let _running = pool
            .try_submit(async move {
                let _ = block_rx.await;
                Ok(ExecutionOutcome::completed("late"))
            })
            .unwrap();

        assert_eq!(pool.available_slots(), 0);
        assert!(pool
            .try_submit(async { Ok(ExecutionOutcome::completed("never")) })
            .is_none());
    }

    #[tokio::test]
    async fn slot_frees_after_completion() {
        let pool = Dispatcher::new(1, None);
        let mut handle = pool
            .try_submit(async { Ok(ExecutionOutcome::completed("one")) })
            .unwrap();
        settle().await;
        assert!(handle.try_harvest().is_some());
        assert!(pool
            .try_submit(async { Ok(ExecutionOutcome::completed("two")) })
            .is_some());
    }

    #[tokio::test]
    async fn harvest_is_nonblocking_while_running() {
        let pool = Dispatcher::new(1, None);
        let (block_tx, block_rx) = oneshot::channel::<()>();
        let mut handle = pool
            .try_submit(async move {
                let _ = block_rx.await;
                Ok(ExecutionOutcome::completed("done"))
            })
            .unwrap();

        assert!(handle.try_harvest().is_none());
        block_tx.send(()).unwrap();
        settle().await;
        assert!(handle.try_harvest().is_some());
    }

    #[tokio::test]
    async fn deadline_turns_hung_job_into_error() {
        let pool = Dispatcher::new(1, Some(Duration::from_millis(10)));
        let mut handle = pool
            .try_submit(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ExecutionOutcome::completed("never"))
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = handle.try_harvest().unwrap();
        assert!(matches!(result, Err(MusterError::Executor(_))));
        // The slot is free again — the agent is not parked forever.
        assert_eq!(pool.available_slots(), 1);
    }
}
