use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_sqs::types::{MessageAttributeValue, MessageSystemAttributeName};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tenantry_broker::{
    Acknowledger, BrokerError, Consumer, Delivery, Message, Publisher, QueueBinding, Subscription,
};

use crate::auth::build_sdk_config;
use crate::config::AwsBaseConfig;
use crate::error::classify_error_chain;

/// Message attribute carrying the routing key a message was published with.
pub const ROUTING_KEY_ATTRIBUTE: &str = "routing-key";

/// SQS caps a single receive at ten messages.
const MAX_RECEIVE_BATCH: usize = 10;

/// Configuration for the SQS broker.
#[derive(Clone, Serialize, Deserialize)]
pub struct SqsConfig {
    #[serde(flatten)]
    pub aws: AwsBaseConfig,

    /// Queue name to queue URL. Queues not listed are resolved with
    /// `GetQueueUrl` when declared.
    #[serde(default)]
    pub queue_urls: BTreeMap<String, String>,

    /// Long-poll wait per receive, in seconds (0-20).
    #[serde(default = "default_wait_time_seconds")]
    pub wait_time_seconds: i32,

    /// Visibility timeout applied to received messages, in seconds. A
    /// delivery not settled within it becomes visible again.
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: i32,
}

fn default_wait_time_seconds() -> i32 {
    20
}

fn default_visibility_timeout_seconds() -> i32 {
    300
}

impl std::fmt::Debug for SqsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsConfig")
            .field("aws", &self.aws)
            .field("queue_urls", &self.queue_urls)
            .field("wait_time_seconds", &self.wait_time_seconds)
            .field(
                "visibility_timeout_seconds",
                &self.visibility_timeout_seconds,
            )
            .finish()
    }
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            aws: AwsBaseConfig::default(),
            queue_urls: BTreeMap::new(),
            wait_time_seconds: default_wait_time_seconds(),
            visibility_timeout_seconds: default_visibility_timeout_seconds(),
        }
    }
}

impl SqsConfig {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            aws: AwsBaseConfig::new(region),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_queue_url(mut self, queue: impl Into<String>, url: impl Into<String>) -> Self {
        self.queue_urls.insert(queue.into(), url.into());
        self
    }

    #[must_use]
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.aws.endpoint_url = Some(endpoint_url.into());
        self
    }

    #[must_use]
    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds.clamp(0, 20);
        self
    }
}

#[derive(Debug, Default)]
struct Routes {
    /// Queue name to URL, for queues that have been declared.
    queues: HashMap<String, String>,
    /// `(destination, routing_key)` to the queue URLs bound to it.
    bindings: HashMap<(String, String), Vec<String>>,
}

/// Broker over SQS queues.
///
/// SQS has no exchanges, so the destination/routing-key bindings are kept
/// in process: each worker declares the bindings it relies on before
/// publishing or subscribing. Redelivery and dead-lettering follow the
/// queue's own visibility timeout and redrive policy.
#[derive(Clone)]
pub struct SqsBroker {
    client: aws_sdk_sqs::Client,
    config: Arc<SqsConfig>,
    routes: Arc<RwLock<Routes>>,
}

impl std::fmt::Debug for SqsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsBroker")
            .field("config", &self.config)
            .field("client", &"<SqsClient>")
            .finish_non_exhaustive()
    }
}

fn failed(operation: &'static str, err: &dyn std::error::Error) -> BrokerError {
    let classified = classify_error_chain(err);
    error!(operation, error = %classified, "SQS request failed");
    classified.into()
}

impl SqsBroker {
    pub async fn new(config: SqsConfig) -> Self {
        let sdk_config = build_sdk_config(&config.aws).await;
        Self::with_client(config, aws_sdk_sqs::Client::new(&sdk_config))
    }

    pub fn with_client(config: SqsConfig, client: aws_sdk_sqs::Client) -> Self {
        Self {
            client,
            config: Arc::new(config),
            routes: Arc::new(RwLock::new(Routes::default())),
        }
    }

    async fn resolve_queue_url(&self, queue: &str) -> Result<String, BrokerError> {
        let known = self
            .routes
            .read()
            .queues
            .get(queue)
            .or_else(|| self.config.queue_urls.get(queue))
            .cloned();
        if let Some(url) = known {
            return Ok(url);
        }
        let output = self
            .client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(aws_sdk_sqs::operation::get_queue_url::GetQueueUrlError::is_queue_does_not_exist)
                {
                    BrokerError::QueueNotFound(queue.to_owned())
                } else {
                    failed("get_queue_url", &e)
                }
            })?;
        output
            .queue_url()
            .map(str::to_owned)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_owned()))
    }
}

#[async_trait]
impl Publisher for SqsBroker {
    #[instrument(skip(self, payload), fields(backend = "sqs", size = payload.len()))]
    async fn publish(
        &self,
        destination: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        let targets = self
            .routes
            .read()
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

        let body = String::from_utf8(payload.to_vec())
            .map_err(|_| BrokerError::Backend("SQS message bodies must be UTF-8".into()))?;
        let attribute = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(routing_key)
            .build()
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        for queue_url in targets {
            let sent = self
                .client
                .send_message()
                .queue_url(&queue_url)
                .message_body(&body)
                .message_attributes(ROUTING_KEY_ATTRIBUTE, attribute.clone())
                .send()
                .await
                .map_err(|e| failed("send_message", &e))?;
            debug!(message_id = sent.message_id().unwrap_or("unknown"), %queue_url, "message sent");
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for SqsBroker {
    async fn declare(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        let url = self.resolve_queue_url(&binding.queue).await?;
        let mut routes = self.routes.write();
        routes.queues.insert(binding.queue.clone(), url.clone());
        let bound = routes
            .bindings
            .entry((binding.destination.clone(), binding.routing_key.clone()))
            .or_default();
        if !bound.contains(&url) {
            bound.push(url);
        }
        info!(queue = %binding.queue, destination = %binding.destination, routing_key = %binding.routing_key, "queue bound");
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let queue_url = self.resolve_queue_url(queue).await?;
        Ok(Box::new(SqsSubscription {
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            queue_url,
            batch: prefetch.clamp(1, MAX_RECEIVE_BATCH),
            buffered: VecDeque::new(),
        }))
    }
}

struct SqsSubscription {
    client: aws_sdk_sqs::Client,
    config: Arc<SqsConfig>,
    queue_url: String,
    batch: usize,
    buffered: VecDeque<Delivery>,
}

impl SqsSubscription {
    async fn receive(&mut self) -> Result<(), BrokerError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(i32::try_from(self.batch).unwrap_or(1))
            .wait_time_seconds(self.config.wait_time_seconds)
            .visibility_timeout(self.config.visibility_timeout_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| failed("receive_message", &e))?;

        for received in output.messages() {
            let Some(receipt_handle) = received.receipt_handle() else {
                warn!("received SQS message without a receipt handle");
                continue;
            };
            let message = to_message(received);
            let acker = SqsAck {
                client: self.client.clone(),
                queue_url: self.queue_url.clone(),
                receipt_handle: receipt_handle.to_owned(),
            };
            self.buffered
                .push_back(Delivery::new(message, Box::new(acker)));
        }
        Ok(())
    }
}

#[async_trait]
impl Subscription for SqsSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            if let Some(delivery) = self.buffered.pop_front() {
                return Ok(Some(delivery));
            }
            self.receive().await?;
        }
    }
}

fn to_message(received: &aws_sdk_sqs::types::Message) -> Message {
    let system = |name: MessageSystemAttributeName| {
        received
            .attributes()
            .and_then(|a| a.get(&name))
            .map(String::as_str)
    };
    let routing_key = received
        .message_attributes()
        .and_then(|a| a.get(ROUTING_KEY_ATTRIBUTE))
        .and_then(MessageAttributeValue::string_value)
        .unwrap_or_default();

    let mut message = Message::new(
        routing_key,
        Bytes::copy_from_slice(received.body().unwrap_or_default().as_bytes()),
    );
    if let Some(id) = received.message_id().and_then(|id| Uuid::parse_str(id).ok()) {
        message.id = id;
    }
    if let Some(sent) = system(MessageSystemAttributeName::SentTimestamp)
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    {
        message.published_at = sent;
    }
    message.delivery_count = system(MessageSystemAttributeName::ApproximateReceiveCount)
        .and_then(|n| n.parse().ok())
        .unwrap_or(1);
    message
}

struct SqsAck {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    receipt_handle: String,
}

impl SqsAck {
    async fn delete(&self) -> Result<(), BrokerError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await
            .map_err(|e| failed("delete_message", &e))?;
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for SqsAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.delete().await
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        if !requeue {
            return self.delete().await;
        }
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| failed("change_message_visibility", &e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SqsConfig::new("eu-west-1");
        assert_eq!(config.wait_time_seconds, 20);
        assert_eq!(config.visibility_timeout_seconds, 300);
        assert!(config.queue_urls.is_empty());
    }

    #[test]
    fn wait_time_is_clamped() {
        assert_eq!(SqsConfig::default().with_wait_time_seconds(60).wait_time_seconds, 20);
        assert_eq!(SqsConfig::default().with_wait_time_seconds(-1).wait_time_seconds, 0);
    }

    #[test]
    fn config_from_document() {
        let config: SqsConfig = serde_json::from_value(serde_json::json!({
            "region": "us-east-1",
            "endpoint_url": "http://elasticmq:9324",
            "queue_urls": { "file-scan": "http://elasticmq:9324/000000000000/file-scan" }
        }))
        .unwrap();
        assert_eq!(config.wait_time_seconds, 20);
        assert_eq!(
            config.queue_urls.get("file-scan").map(String::as_str),
            Some("http://elasticmq:9324/000000000000/file-scan")
        );
    }

    #[test]
    fn received_message_carries_routing_key_and_receive_count() {
        let received = aws_sdk_sqs::types::Message::builder()
            .message_id("0191e0a4-0000-7000-8000-00000000000a")
            .receipt_handle("rh-1")
            .body(r#"{"bucket":"uploads"}"#)
            .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "3")
            .attributes(MessageSystemAttributeName::SentTimestamp, "1760000000000")
            .message_attributes(
                ROUTING_KEY_ATTRIBUTE,
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("file.uploaded")
                    .build()
                    .unwrap(),
            )
            .build();
        let message = to_message(&received);
        assert_eq!(message.routing_key, "file.uploaded");
        assert_eq!(message.delivery_count, 3);
        assert!(message.redelivered());
        assert_eq!(message.published_at.timestamp(), 1_760_000_000);
        assert_eq!(message.id.to_string(), "0191e0a4-0000-7000-8000-00000000000a");
        assert_eq!(&message.payload[..], br#"{"bucket":"uploads"}"#);
    }
}
