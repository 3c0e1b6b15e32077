//! Message broker abstraction
//!
//! Delivery is at-least-once: a received message stays in flight until it
//! is acked, and a nack (or a crash before the ack) makes it deliverable
//! again. Consumers must therefore tolerate duplicates.

mod memory;
mod spool;

use std::time::Duration;

use relay_protocol::{Envelope, Message, ProtocolError, Queue};
use thiserror::Error;

pub use memory::MemoryBroker;
pub use spool::SpoolBroker;

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// A message handed to a consumer, pending ack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: Queue,
    /// Broker-specific handle used by `ack` / `nack`
    pub tag: String,
    pub envelope: Envelope,
}

/// Durable queue operations used by the dispatcher, workers and the update pool.
pub trait Broker: Send + Sync {
    /// Enqueue an envelope.
    fn publish(&self, queue: &Queue, envelope: &Envelope) -> Result<()>;

    /// Wait up to `timeout` for the next message on `queue`.
    fn receive(&self, queue: &Queue, timeout: Duration) -> Result<Option<Delivery>>;

    /// Settle a delivery.
    fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a delivery to its queue for redelivery.
    fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// Wrap `body` in a fresh envelope and publish it.
    fn send(&self, queue: &Queue, body: Message) -> Result<Envelope> {
        let envelope = Envelope::new(body);
        self.publish(queue, &envelope)?;
        tracing::debug!(queue = %queue, message_id = %envelope.message_id, "Published message");
        Ok(envelope)
    }
}
