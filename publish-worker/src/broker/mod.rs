//! Broker transports.
//!
//! The pipeline talks to the broker only through [`Transport`] and
//! [`ConsumerChannel`]:
//! - [`AmqpTransport`]: RabbitMQ via lapin
//! - [`MemoryTransport`]: in-process queues for tests and local runs
//!
//! Every consumer opens its own [`ConsumerChannel`]; channels are never
//! shared between consumers.

pub mod amqp;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::QueueBinding;
use crate::error::PipelineError;

pub use amqp::AmqpTransport;
pub use memory::MemoryTransport;

/// A serialized message ready to hand to the broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    /// Hold the message back from consumers for this long
    pub delay: Option<Duration>,
}

/// One in-flight delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Handle used to ack/nack this delivery on its channel
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    pub redelivered: bool,
    /// Times the broker has delivered this message before, when it tracks it
    pub delivery_count: Option<u32>,
}

/// What a consumer should tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue
    Ack,
    /// Not processed; the broker redelivers it
    Requeue,
    /// Never processable; nack without requeue so the broker dead-letters it
    Reject,
}

/// Connection-level broker operations.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Channel: ConsumerChannel;

    /// Publish to the binding's exchange under its routing key.
    async fn publish(
        &self,
        binding: &QueueBinding,
        message: OutboundMessage,
    ) -> Result<(), PipelineError>;

    /// Open an exclusive channel consuming from the binding's queue.
    async fn open_consumer(
        &self,
        binding: &QueueBinding,
        consumer_tag: &str,
    ) -> Result<Self::Channel, PipelineError>;
}

/// A single consumer's channel.
#[async_trait]
pub trait ConsumerChannel: Send + Sync + 'static {
    /// Wait for the next delivery. `None` means the consumer was closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, PipelineError>>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), PipelineError>;

    async fn close(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Settle a delivery according to `disposition`.
    async fn settle(
        &self,
        delivery_tag: u64,
        disposition: Disposition,
    ) -> Result<(), PipelineError> {
        match disposition {
            Disposition::Ack => self.ack(delivery_tag).await,
            Disposition::Requeue => self.nack(delivery_tag, true).await,
            Disposition::Reject => self.nack(delivery_tag, false).await,
        }
    }
}
