use chrono::{DateTime, Utc};

use crate::message::Message;

/// A message removed from the normal delivery path.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: Message,
    /// Why it was dead-lettered: `rejected` or `max_deliveries`.
    pub reason: &'static str,
    pub at: DateTime<Utc>,
}

impl DeadLetter {
    pub const REJECTED: &'static str = "rejected";
    pub const MAX_DELIVERIES: &'static str = "max_deliveries";

    pub(crate) fn new(message: Message, reason: &'static str) -> Self {
        Self {
            message,
            reason,
            at: Utc::now(),
        }
    }
}
