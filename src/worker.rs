//! Bounded concurrent executor for per-request pipelines.
//!
//! Fixed worker count, bounded MPMC queue. Submission never blocks: a full
//! queue returns `Saturated` and the gateway translates that to HTTP 503.
//! Shutdown stops intake, lets the workers drain the queue up to a deadline,
//! then aborts stragglers.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker pool saturated")]
    Saturated,

    #[error("worker pool shut down")]
    Closed,
}

pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // Take one job, then release the receiver before
                        // running it so the other workers keep pulling.
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    tracing::debug!(target: "WORKER", worker_id, "worker exited");
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            workers: workers.max(1),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Queue a fire-and-forget task.
    pub fn try_submit(
        &self,
        task: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), SubmitError> {
        let sender = {
            let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(SubmitError::Closed);
        };
        sender.try_send(Box::pin(task)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::Saturated,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Queue a task and hand back a receiver for its result. The receiver
    /// yields an error if the pool is torn down before the task runs.
    pub fn submit<T, F>(&self, task: F) -> Result<oneshot::Receiver<T>, SubmitError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.try_submit(async move {
            let _ = done_tx.send(task.await);
        })?;
        Ok(done_rx)
    }

    /// Stop intake, drain the queue up to `drain_deadline`, then cancel
    /// whatever is still running.
    pub async fn shutdown(&self, drain_deadline: Duration) {
        {
            let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        let drain_all = async {
            for handle in &handles {
                // JoinHandle is not restartable; abort below covers failures.
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };
        if tokio::time::timeout(drain_deadline, drain_all).await.is_err() {
            let stragglers = handles.iter().filter(|h| !h.is_finished()).count();
            tracing::warn!(target: "WORKER", stragglers, "drain deadline hit, cancelling stragglers");
            for handle in &handles {
                handle.abort();
            }
        }
        tracing::info!(target: "WORKER", "worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_submit_returns_result() {
        let pool = WorkerPool::new(2, 8);
        let rx = pool.submit(async { 21 * 2 }).unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_all_tasks_run() {
        let pool = WorkerPool::new(4, 64);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut receivers = Vec::new();
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            receivers.push(
                pool.submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn test_full_queue_is_saturated() {
        // One worker stuck on a long task, queue of one.
        let pool = WorkerPool::new(1, 1);
        let (block_tx, block_rx) = oneshot::channel::<()>();
        pool.try_submit(async move {
            let _ = block_rx.await;
        })
        .unwrap();
        // Give the worker a beat to pick the blocker up.
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fills the single queue slot.
        pool.try_submit(async {}).unwrap();
        // No room left.
        assert_eq!(pool.try_submit(async {}), Err(SubmitError::Saturated));

        let _ = block_tx.send(());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let pool = WorkerPool::new(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.try_submit(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(pool.try_submit(async {}), Err(SubmitError::Closed));
    }
}
