use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::PipelineError;

/// A fixed-capacity queue drained by a fixed pool of workers.
///
/// [`enqueue`](Self::enqueue) waits while the queue is full, which pushes
/// back on the producer. [`shutdown`](Self::shutdown) stops intake and
/// waits for queued items to be processed.
#[derive(Debug)]
pub struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
    workers: JoinSet<()>,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn start<F, Fut>(capacity: usize, workers: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            set.spawn(async move {
                loop {
                    // Hold the receiver only while waiting, not while working.
                    let item = rx.lock().await.recv().await;
                    let Some(item) = item else { break };
                    handler(item).await;
                }
                debug!(worker, "work queue worker stopped");
            });
        }
        Self { tx, workers: set }
    }

    /// Add `item`, waiting for room when the queue is full.
    pub async fn enqueue(&self, item: T) -> Result<(), PipelineError> {
        self.tx
            .send(item)
            .await
            .map_err(|_| PipelineError::QueueClosed)
    }

    /// Add `item` without waiting.
    pub fn try_enqueue(&self, item: T) -> Result<(), PipelineError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PipelineError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PipelineError::QueueClosed,
        })
    }

    /// Free slots.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// Stop accepting items and wait until every queued item is handled.
    pub async fn shutdown(self) {
        let Self { tx, mut workers } = self;
        drop(tx);
        while workers.join_next().await.is_some() {}
        info!("work queue drained");
    }
}
