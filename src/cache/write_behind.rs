//! Write-behind drain: hot-store writes are acknowledged immediately, the
//! system of record catches up asynchronously in batches.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tokio::sync::watch;

use crate::metrics::MetricsCollector;
use crate::source::SourceWriter;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub key: String,
    pub value: String,
}

pub struct WriteBehindQueue {
    queue: ArrayQueue<PendingWrite>,
    writer: Arc<dyn SourceWriter>,
    metrics: Arc<MetricsCollector>,
}

impl WriteBehindQueue {
    pub fn new(
        capacity: usize,
        writer: Arc<dyn SourceWriter>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            writer,
            metrics,
        }
    }

    /// Park a write for the drain task. On overflow the write is dropped
    /// from the queue (the hot-store copy is still current), the drop is
    /// counted, and the caller proceeds.
    pub fn enqueue(&self, write: PendingWrite) {
        if let Err(write) = self.queue.push(write) {
            self.metrics.record_dropped_write();
            tracing::warn!(
                target: "CACHE",
                key = %write.key,
                "write-behind queue full, system-of-record write dropped"
            );
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drain up to `batch` writes. Stops at the first persistence failure
    /// and re-parks the failed write. Returns how many were persisted.
    pub async fn drain_once(&self, batch: usize) -> usize {
        let mut drained = 0;
        for _ in 0..batch {
            let Some(write) = self.queue.pop() else { break };
            match self.writer.persist(&write.key, &write.value).await {
                Ok(()) => drained += 1,
                Err(err) => {
                    tracing::warn!(target: "CACHE", key = %write.key, "write-behind persist failed: {err}");
                    if self.queue.push(write).is_err() {
                        self.metrics.record_dropped_write();
                    }
                    break;
                }
            }
        }
        drained
    }

    /// Background drain loop; makes a final pass on shutdown.
    pub async fn run_drain(
        self: Arc<Self>,
        interval: Duration,
        batch: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            let drained = self.drain_once(batch).await;
            if drained > 0 {
                tracing::debug!(target: "CACHE", drained, pending = self.pending(), "write-behind batch persisted");
            }
        }
        let drained = self.drain_once(usize::MAX).await;
        tracing::info!(target: "CACHE", drained, pending = self.pending(), "write-behind drain stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    #[tokio::test]
    async fn test_drain_persists_in_order() {
        let source = Arc::new(MemorySource::new());
        let metrics = Arc::new(MetricsCollector::new());
        let queue = WriteBehindQueue::new(8, source.clone(), metrics);

        queue.enqueue(PendingWrite {
            key: "k1".into(),
            value: "1".into(),
        });
        queue.enqueue(PendingWrite {
            key: "k2".into(),
            value: "2".into(),
        });
        assert_eq!(queue.pending(), 2);

        assert_eq!(queue.drain_once(10).await, 2);
        assert_eq!(queue.pending(), 0);
        assert_eq!(source.get("k1").as_deref(), Some("1"));
        assert_eq!(source.get("k2").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_overflow_counts_dropped_write() {
        let source = Arc::new(MemorySource::new());
        let metrics = Arc::new(MetricsCollector::new());
        let queue = WriteBehindQueue::new(1, source, metrics.clone());

        queue.enqueue(PendingWrite {
            key: "k1".into(),
            value: "1".into(),
        });
        queue.enqueue(PendingWrite {
            key: "k2".into(),
            value: "2".into(),
        });
        assert_eq!(queue.pending(), 1);
        assert_eq!(metrics.snapshot().dropped_writes, 1);
    }

    #[tokio::test]
    async fn test_failed_persist_is_reparked() {
        let source = Arc::new(MemorySource::new());
        source.set_failing(true);
        let metrics = Arc::new(MetricsCollector::new());
        let queue = WriteBehindQueue::new(4, source.clone(), metrics);

        queue.enqueue(PendingWrite {
            key: "k1".into(),
            value: "1".into(),
        });
        assert_eq!(queue.drain_once(10).await, 0);
        assert_eq!(queue.pending(), 1);

        source.set_failing(false);
        assert_eq!(queue.drain_once(10).await, 1);
        assert_eq!(source.get("k1").as_deref(), Some("1"));
    }
}
