//! Owned worker tasks.
//!
//! Every long-running loop (publisher engine, request router, subscriber
//! engine) runs as a tokio task owned by a [`WorkerHandle`]. The handle holds
//! the task's cancellation token, so shutdown is always "cancel, then join".

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{RelayError, Result};

/// A spawned worker and its cancellation token.
#[derive(Debug)]
pub struct WorkerHandle<T> {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Spawn `work` with a child token of `parent`.
    ///
    /// Cancelling `parent` cancels the worker; cancelling the worker leaves
    /// `parent` untouched.
    pub fn spawn<F, Fut>(name: impl Into<String>, parent: &CancellationToken, work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let name = name.into();
        let cancel = parent.child_token();
        debug!(worker = %name, "Spawning worker");
        let task = tokio::spawn(work(cancel.clone()));
        Self { name, cancel, task }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker to exit.
    ///
    /// A panic inside the worker is converted into [`RelayError::Worker`].
    pub async fn join(self) -> Result<T> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!(worker = %self.name, error = %e, "Worker task failed");
                Err(RelayError::worker(self.name, e.to_string()))
            }
        }
    }

    /// Cancel the worker and wait for it to exit.
    pub async fn shutdown(self) -> Result<T> {
        self.cancel();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_worker_returns_its_result() {
        let root = CancellationToken::new();
        let worker = WorkerHandle::spawn("counter", &root, |cancel| async move {
            cancel.cancelled().await;
            Ok(7u32)
        });
        assert_eq!(worker.name(), "counter");
        assert!(!worker.is_finished());
        assert_eq!(worker.shutdown().await.unwrap(), 7);
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_children() {
        let root = CancellationToken::new();
        let worker = WorkerHandle::spawn("child", &root, |cancel| async move {
            cancel.cancelled().await;
            Ok(())
        });
        root.cancel();
        worker.join().await.unwrap();
    }

    fn should_panic_now() -> bool {
        true
    }

    #[tokio::test]
    async fn panics_become_worker_errors() {
        let root = CancellationToken::new();
        let worker: WorkerHandle<()> = WorkerHandle::spawn("doomed", &root, |_| async move {
            if should_panic_now() {
                panic!("boom");
            }
            Ok(())
        });
        let err = worker.join().await.unwrap_err();
        assert!(matches!(err, RelayError::Worker { ref worker, .. } if worker == "doomed"));
    }
}
