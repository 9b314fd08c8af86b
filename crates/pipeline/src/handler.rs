use async_trait::async_trait;
use tracing::{error, warn};

use tenantry_broker::{Delivery, Message};

use crate::error::PipelineError;

/// Processes the payload of one broker message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handle `message`. The consumer settles the delivery from the result:
    /// success acknowledges, a poison error rejects, anything else requeues.
    async fn handle(&self, message: &Message) -> Result<(), PipelineError>;
}

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Negative acknowledgement with requeue; the broker bounds redelivery.
    Requeue,
    /// Remove without redelivery.
    Reject,
}

impl Disposition {
    pub fn of(result: &Result<(), PipelineError>) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(e) if e.is_poison() => Self::Reject,
            Err(_) => Self::Requeue,
        }
    }
}

/// Run `handler` on `delivery` and settle it.
pub async fn dispatch(handler: &dyn MessageHandler, delivery: Delivery) -> Disposition {
    let result = handler.handle(&delivery.message).await;
    let disposition = Disposition::of(&result);
    let message_id = delivery.message.id;
    let attempt = delivery.message.delivery_count;

    let settled = match &result {
        Ok(()) => delivery.ack().await,
        Err(e) if disposition == Disposition::Reject => {
            error!(handler = handler.name(), %message_id, error = %e, "poison message rejected");
            delivery.reject().await
        }
        Err(e) => {
            warn!(
                handler = handler.name(),
                %message_id,
                attempt,
                retryable = e.is_retryable(),
                error = %e,
                "message requeued"
            );
            delivery.nack(true).await
        }
    };
    if let Err(e) = settled {
        // The broker redelivers an unsettled message; processing is
        // idempotent, so a lost ack costs only a duplicate check.
        warn!(handler = handler.name(), %message_id, error = %e, "failed to settle delivery");
    }
    disposition
}
