use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A message as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub routing_key: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub published_at: DateTime<Utc>,
    /// Number of times this message has been handed to a consumer,
    /// including this one.
    pub delivery_count: u32,
}

impl Message {
    pub fn new(routing_key: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id: Uuid::now_v7(),
            routing_key: routing_key.into(),
            payload,
            headers: HashMap::new(),
            published_at: Utc::now(),
            delivery_count: 0,
        }
    }

    /// Whether an earlier delivery of this message went unacknowledged.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}
