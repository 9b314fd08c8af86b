use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broker::{Acknowledger, Consumer, Delivery, Publisher, Subscription};
use crate::config::MemoryBrokerConfig;
use crate::dead_letter::DeadLetter;
use crate::error::BrokerError;
use crate::message::Message;
use crate::topology::QueueBinding;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: usize,
    dead: Vec<DeadLetter>,
}

#[derive(Debug, Default)]
struct Inner {
    bindings: HashMap<(String, String), Vec<String>>,
    queues: HashMap<String, QueueState>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    config: MemoryBrokerConfig,
}

/// In-process broker with direct routing, manual acknowledgement,
/// prefetch limits and dead-lettering. Clones share the same queues.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                notify: Notify::new(),
                config,
            }),
        }
    }

    /// Declare a queue and binding without going through the trait.
    pub fn bind(&self, binding: &QueueBinding) {
        let mut inner = self.shared.inner.lock();
        inner.queues.entry(binding.queue.clone()).or_default();
        let queues = inner
            .bindings
            .entry((binding.destination.clone(), binding.routing_key.clone()))
            .or_default();
        if !queues.contains(&binding.queue) {
            queues.push(binding.queue.clone());
        }
    }

    /// Stop all subscriptions. Pending `next` calls return `None`.
    pub fn close(&self) {
        self.shared.inner.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet settled.
    pub fn in_flight(&self, queue: &str) -> usize {
        self.shared
            .inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.in_flight)
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        self.shared
            .inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.dead.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(
        &self,
        destination: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(BrokerError::Closed);
            }
            let targets = inner
                .bindings
                .get(&(destination.to_owned(), routing_key.to_owned()))
                .cloned()
                .unwrap_or_default();
            if targets.is_empty() {
                return Err(BrokerError::Unroutable {
                    destination: destination.to_owned(),
                    routing_key: routing_key.to_owned(),
                });
            }
            let message = Message::new(routing_key, payload);
            for queue in targets {
                inner
                    .queues
                    .entry(queue)
                    .or_default()
                    .ready
                    .push_back(message.clone());
            }
            debug!(destination, routing_key, message_id = %message.id, "published");
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryBroker {
    async fn declare(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        self.bind(binding);
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        if !self.shared.inner.lock().queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_owned()));
        }
        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            queue: queue.to_owned(),
            prefetch: prefetch.max(1),
        }))
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    queue: String,
    prefetch: usize,
}

impl MemorySubscription {
    fn try_take(&self) -> Result<Option<Option<Delivery>>, BrokerError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Ok(Some(None));
        }
        let queue = inner
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::QueueNotFound(self.queue.clone()))?;
        if queue.in_flight >= self.prefetch {
            return Ok(None);
        }
        let Some(mut message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        queue.in_flight += 1;
        message.delivery_count += 1;
        let acker = MemoryAck {
            shared: Arc::clone(&self.shared),
            queue: self.queue.clone(),
            message: Some(message.clone()),
        };
        Ok(Some(Some(Delivery::new(message, Box::new(acker)))))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_take()? {
                return Ok(outcome);
            }
            notified.await;
        }
    }
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

struct MemoryAck {
    shared: Arc<Shared>,
    queue: String,
    /// `None` once settled.
    message: Option<Message>,
}

impl MemoryAck {
    fn settle(&mut self, settle: Settle) {
        let Some(message) = self.message.take() else {
            return;
        };
        {
            let mut inner = self.shared.inner.lock();
            let Some(queue) = inner.queues.get_mut(&self.queue) else {
                return;
            };
            queue.in_flight = queue.in_flight.saturating_sub(1);
            match settle {
                Settle::Ack => {}
                Settle::Requeue if message.delivery_count >= self.shared.config.max_deliveries => {
                    warn!(
                        queue = %self.queue,
                        message_id = %message.id,
                        deliveries = message.delivery_count,
                        "max deliveries reached, dead-lettering"
                    );
                    queue
                        .dead
                        .push(DeadLetter::new(message, DeadLetter::MAX_DELIVERIES));
                }
                Settle::Requeue => queue.ready.push_front(message),
                Settle::Reject => queue.dead.push(DeadLetter::new(message, DeadLetter::REJECTED)),
            }
        }
        self.shared.notify.notify_waiters();
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        self.settle(Settle::Requeue);
    }
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        self.settle(Settle::Ack);
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.settle(if requeue { Settle::Requeue } else { Settle::Reject });
        Ok(())
    }
}
