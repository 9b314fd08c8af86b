//! Message broker abstractions.
//!
//! Publishing goes to a named destination with a routing key; queues are
//! bound to `(destination, routing_key)` pairs. Consumption is manual-ack:
//! every [`Delivery`] must be settled with [`Delivery::ack`],
//! [`Delivery::nack`] or [`Delivery::reject`]. A delivery dropped unsettled
//! is returned to its queue.

pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod memory;
pub mod message;
pub mod topology;

pub use broker::{Acknowledger, Consumer, Delivery, Publisher, Subscription};
pub use config::MemoryBrokerConfig;
pub use dead_letter::DeadLetter;
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use message::Message;
pub use topology::{QueueBinding, SCAN_QUEUE, SCAN_ROUTING_KEY, UPLOADS_DESTINATION};
