//! Bounded in-memory delivery queue.
//!
//! Producers go through a cloneable [`QueueHandle`] and never wait: a
//! message is either accepted at once or rejected with a [`QueueError`].
//! Workers share one [`QueueReceiver`] and take messages in FIFO order.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::errors::QueueError;
use crate::observability::{DeliveryMetrics, MetricsSnapshot};
use crate::types::Message;

/// Creates a queue with `capacity` slots (at least one).
///
/// `shutdown` is observed by [`QueueHandle::enqueue`]: once it is cancelled
/// every new message is rejected with [`QueueError::Stopping`].
pub fn bounded(
    capacity: usize,
    shutdown: CancellationToken,
    metrics: Arc<DeliveryMetrics>,
) -> (QueueHandle, QueueReceiver) {
    let capacity = capacity.max(1);
    let (sender, receiver) = mpsc::channel(capacity);

    let handle = QueueHandle {
        sender: Arc::new(RwLock::new(Some(sender))),
        shutdown,
        metrics,
        capacity,
    };
    let receiver = QueueReceiver {
        inner: Arc::new(Mutex::new(receiver)),
    };

    (handle, receiver)
}

/// Producer side of the queue.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    /// `None` once the queue has been closed.
    sender: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    shutdown: CancellationToken,
    metrics: Arc<DeliveryMetrics>,
    capacity: usize,
}

impl QueueHandle {
    /// Offers a message to the queue without waiting.
    pub fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        let result = self.try_enqueue(message);

        match result {
            Ok(()) => self.metrics.record_queued(),
            Err(QueueError::Full) => self.metrics.record_rejected_full(),
            Err(QueueError::Stopping) => self.metrics.record_rejected_stopping(),
        }

        result
    }

    fn try_enqueue(&self, message: Message) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Stopping);
        }

        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(QueueError::Stopping)?;

        sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Stopping,
        })
    }

    /// Drops the sending side. Buffered messages stay receivable; once they
    /// are gone the receiver reports the queue as closed.
    pub(crate) fn close(&self) {
        let mut guard = self.sender.write().unwrap_or_else(PoisonError::into_inner);
        guard.take();
    }

    /// Returns true once shutdown has begun.
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered messages right now; zero once closed.
    pub fn len(&self) -> usize {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(|sender| sender.max_capacity() - sender.capacity())
            .unwrap_or(0)
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivery counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Consumer side of the queue, shared by all workers.
#[derive(Debug, Clone)]
pub struct QueueReceiver {
    inner: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl QueueReceiver {
    /// Waits for the next message. Returns `None` once the queue is closed
    /// and empty.
    pub async fn recv(&self) -> Option<Message> {
        self.inner.lock().await.recv().await
    }
}
