//! Long-running queue consumption with reconnect.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tenantry_broker::{Consumer, QueueBinding};
use tenantry_core::RetryStrategy;

use crate::error::PipelineError;
use crate::handler::{MessageHandler, dispatch};

/// Settings for one consumer loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub binding: QueueBinding,
    /// Unsettled deliveries the broker may hand out at once.
    pub prefetch: usize,
    /// Messages processed at the same time. One keeps duplicate detection
    /// strictly ordered per queue.
    pub concurrency: usize,
    /// Backoff between reconnect attempts after a transient broker failure.
    pub reconnect: RetryStrategy,
    /// Give up after this many consecutive failed reconnects; `0` retries
    /// forever.
    pub max_reconnect_attempts: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            binding: QueueBinding::scan_queue(),
            prefetch: 1,
            concurrency: 1,
            reconnect: RetryStrategy::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(30),
                multiplier: 2.0,
            },
            max_reconnect_attempts: 0,
        }
    }
}

impl ConsumerConfig {
    pub fn new(binding: QueueBinding) -> Self {
        Self {
            binding,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self.prefetch = self.prefetch.max(self.concurrency);
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: RetryStrategy, max_attempts: u32) -> Self {
        self.reconnect = reconnect;
        self.max_reconnect_attempts = max_attempts;
        self
    }
}

/// Feeds deliveries from one queue to a [`MessageHandler`].
///
/// Declares the queue binding, subscribes, and settles each delivery from
/// the handler's result. Transient broker failures close the subscription
/// and reconnect with backoff.
pub struct QueueConsumer {
    consumer: Arc<dyn Consumer>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("handler", &self.handler.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueueConsumer {
    pub fn new(
        consumer: Arc<dyn Consumer>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            consumer,
            handler,
            config,
        }
    }

    /// Consume until `cancel` fires or the broker closes.
    ///
    /// Messages already being handled when cancellation arrives are
    /// finished and settled before this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let queue = &self.config.binding.queue;
        let mut failures = 0u32;
        loop {
            match self.consume(&cancel, &mut failures).await {
                Ok(()) => {
                    info!(queue = %queue, handler = self.handler.name(), "consumer stopped");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if self.config.max_reconnect_attempts > 0
                        && failures >= self.config.max_reconnect_attempts
                    {
                        error!(queue = %queue, failures, error = %e, "giving up on broker");
                        return Err(e);
                    }
                    let delay = self.config.reconnect.delay_for(failures - 1);
                    warn!(
                        queue = %queue,
                        failures,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "broker unavailable, reconnecting"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "consumer failed");
                    return Err(e);
                }
            }
        }
    }

    async fn consume(
        &self,
        cancel: &CancellationToken,
        failures: &mut u32,
    ) -> Result<(), PipelineError> {
        let binding = &self.config.binding;
        self.consumer.declare(binding).await?;
        let mut subscription = self
            .consumer
            .subscribe(&binding.queue, self.config.prefetch.max(1))
            .await?;
        *failures = 0;
        info!(
            queue = %binding.queue,
            handler = self.handler.name(),
            concurrency = self.config.concurrency,
            "consuming"
        );

        let concurrency = self.config.concurrency.max(1);
        let mut in_flight = JoinSet::new();
        let result = loop {
            while in_flight.len() >= concurrency {
                in_flight.join_next().await;
            }
            let next = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                next = subscription.next() => next,
            };
            match next {
                Ok(Some(delivery)) => {
                    debug!(message_id = %delivery.message.id, "delivery received");
                    let handler = Arc::clone(&self.handler);
                    in_flight.spawn(async move { dispatch(handler.as_ref(), delivery).await });
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        while in_flight.join_next().await.is_some() {}
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tenantry_broker::{MemoryBroker, Message, Publisher, SCAN_QUEUE, SCAN_ROUTING_KEY, UPLOADS_DESTINATION};

    use super::*;

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl MessageHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, _message: &Message) -> Result<(), PipelineError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn drains_queue_until_broker_closes() {
        let broker = MemoryBroker::default();
        broker.bind(&QueueBinding::scan_queue());
        for _ in 0..3 {
            broker
                .publish(UPLOADS_DESTINATION, SCAN_ROUTING_KEY, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let handler = Arc::new(Counting::default());
        let consumer = QueueConsumer::new(
            Arc::new(broker.clone()),
            handler.clone(),
            ConsumerConfig::default().with_concurrency(2),
        );

        let run = tokio::spawn(async move { consumer.run(CancellationToken::new()).await });
        while broker.ready_count(SCAN_QUEUE) + broker.in_flight(SCAN_QUEUE) > 0 {
            tokio::task::yield_now().await;
        }
        broker.close();
        run.await.unwrap().unwrap();
        assert_eq!(handler.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_consumer() {
        let broker = MemoryBroker::default();
        let consumer = QueueConsumer::new(
            Arc::new(broker),
            Arc::new(Counting::default()),
            ConsumerConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        consumer.run(cancel).await.unwrap();
    }
}
