//! Progress fan-out from a running pipeline.
//!
//! The engine publishes counter snapshots over a watch channel; the CLI (or
//! any embedder) subscribes without slowing the stages down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub rows_read: u64,
    pub rows_written: u64,
    pub batches_written: u64,
}

/// Shared counters owned by the engine; cheap to clone across stages.
#[derive(Clone)]
pub struct Progress {
    rows_read: Arc<AtomicU64>,
    rows_written: Arc<AtomicU64>,
    batches_written: Arc<AtomicU64>,
    tx: Arc<watch::Sender<ProgressSnapshot>>,
}

impl Progress {
    pub fn new() -> (Self, watch::Receiver<ProgressSnapshot>) {
        let (tx, rx) = watch::channel(ProgressSnapshot::default());
        (
            Progress {
                rows_read: Arc::new(AtomicU64::new(0)),
                rows_written: Arc::new(AtomicU64::new(0)),
                batches_written: Arc::new(AtomicU64::new(0)),
                tx: Arc::new(tx),
            },
            rx,
        )
    }

    pub fn add_rows_read(&self, n: u64) {
        self.rows_read.fetch_add(n, Ordering::Relaxed);
        self.publish();
    }

    pub fn add_rows_written(&self, n: u64) {
        self.rows_written.fetch_add(n, Ordering::Relaxed);
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.publish();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
        }
    }

    fn publish(&self) {
        // Receivers may be gone; progress is best-effort.
        let _ = self.tx.send(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshots_flow_to_subscribers() {
        let (progress, mut rx) = Progress::new();
        progress.add_rows_read(10);
        progress.add_rows_written(10);
        rx.changed().await.unwrap();
        let snap = *rx.borrow();
        assert_eq!(snap.rows_read, 10);
        assert_eq!(snap.rows_written, 10);
        assert_eq!(snap.batches_written, 1);
    }
}
