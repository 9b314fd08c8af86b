use serde::{Deserialize, Serialize};

/// Destination that upload-scan events are published to.
pub const UPLOADS_DESTINATION: &str = "file-uploads";
/// Routing key carried by every upload-scan event.
pub const SCAN_ROUTING_KEY: &str = "file.uploaded";
/// Durable queue the scan worker consumes.
pub const SCAN_QUEUE: &str = "file-scan";

/// Routes messages published to `destination` with `routing_key` into
/// `queue`. Direct routing: the key must match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueBinding {
    pub queue: String,
    pub destination: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(
        queue: impl Into<String>,
        destination: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            destination: destination.into(),
            routing_key: routing_key.into(),
        }
    }

    /// The binding the scan worker relies on.
    pub fn scan_queue() -> Self {
        Self::new(SCAN_QUEUE, UPLOADS_DESTINATION, SCAN_ROUTING_KEY)
    }
}
