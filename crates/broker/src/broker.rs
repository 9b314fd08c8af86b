use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BrokerError;
use crate::message::Message;
use crate::topology::QueueBinding;

/// Settles one delivery with the broker that produced it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Negative acknowledgement. With `requeue` the message becomes
    /// available again; without it the message leaves the queue.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, to be settled exactly once.
pub struct Delivery {
    pub message: Message,
    acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }

    /// Remove a message that can never be processed.
    pub async fn reject(self) -> Result<(), BrokerError> {
        self.acker.nack(false).await
    }
}

/// Publishes messages to a destination.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload`. Fails with [`BrokerError::Unroutable`] rather
    /// than dropping a message no queue would receive.
    async fn publish(
        &self,
        destination: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), BrokerError>;
}

/// A stream of deliveries from one queue.
#[async_trait]
pub trait Subscription: Send {
    /// The next delivery, waiting until one is available. `None` once the
    /// broker has been closed.
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError>;
}

/// Declares queues and opens subscriptions.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Declare the queue and its binding. Idempotent.
    async fn declare(&self, binding: &QueueBinding) -> Result<(), BrokerError>;

    /// Subscribe to `queue` with at most `prefetch` unsettled deliveries.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Box<dyn Subscription>, BrokerError>;
}
