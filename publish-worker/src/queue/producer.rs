//! Typed producer for one queue binding.
//!
//! The producer serializes a [`QueueMessage`] and hands it to the transport.
//! It never retries: a failed publish is returned to the caller, and the
//! message is lost unless the caller tries again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use super::types::QueueMessage;
use crate::broker::{OutboundMessage, Transport};
use crate::config::QueueBinding;
use crate::error::PipelineError;

/// Publishes messages to the exchange/routing key of a single binding.
///
/// Cheap to clone and safe to use from many tasks at once.
pub struct Producer<T: Transport> {
    transport: Arc<T>,
    binding: Arc<QueueBinding>,
}

impl<T: Transport> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            binding: Arc::clone(&self.binding),
        }
    }
}

impl<T: Transport> Producer<T> {
    pub fn new(transport: Arc<T>, binding: Arc<QueueBinding>) -> Self {
        Self { transport, binding }
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Publish a message so it is immediately visible to consumers.
    pub async fn publish<M: QueueMessage + Sync>(&self, message: &M) -> Result<(), PipelineError> {
        self.send(message, None).await
    }

    /// Publish a message that only becomes visible after `delay`.
    ///
    /// `None` publishes immediately.
    pub async fn publish_delayed<M: QueueMessage + Sync>(
        &self,
        message: &M,
        delay: Option<Duration>,
    ) -> Result<(), PipelineError> {
        self.send(message, delay).await
    }

    async fn send<M: QueueMessage + Sync>(
        &self,
        message: &M,
        delay: Option<Duration>,
    ) -> Result<(), PipelineError> {
        let message_id = message.message_id();
        let body = serde_json::to_vec(message)?;

        let outbound = OutboundMessage {
            message_id: message_id.clone(),
            body,
            delay,
        };

        if let Err(e) = self.transport.publish(&self.binding, outbound).await {
            error!(
                queue = %self.binding.queue_name,
                message_id = %message_id,
                error = %e,
                "producer_publish_failed"
            );
            return Err(e);
        }

        info!(
            queue = %self.binding.queue_name,
            message_id = %message_id,
            delayed = delay.is_some(),
            "producer_message_enqueued"
        );

        Ok(())
    }
}
