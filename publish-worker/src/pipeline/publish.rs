//! Handler for the publish queue.
//!
//! Each request is attempted once per delivery. A final answer goes to the
//! outcome sink; a `Processing` answer is handed to the status-update queue,
//! which owns all further polling.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{body_preview, exceeds_delivery_budget};
use crate::broker::{Delivery, Disposition, Transport};
use crate::error::PipelineError;
use crate::pool::MessageHandler;
use crate::publication::{OutcomeSink, PublicationService, TerminalOutcome};
use crate::queue::{Producer, PublishRequest, StatusUpdateRequest};
use crate::shutdown::Shutdown;

/// Consumes [`PublishRequest`]s.
pub struct PublishHandler<T: Transport> {
    service: Arc<dyn PublicationService>,
    status_producer: Producer<T>,
    sink: Arc<dyn OutcomeSink>,
    /// Redelivery budget of the publish queue (0 = unbounded)
    max_retry_count: u32,
}

impl<T: Transport> PublishHandler<T> {
    pub fn new(
        service: Arc<dyn PublicationService>,
        status_producer: Producer<T>,
        sink: Arc<dyn OutcomeSink>,
        max_retry_count: u32,
    ) -> Self {
        Self {
            service,
            status_producer,
            sink,
            max_retry_count,
        }
    }

    async fn process(
        &self,
        request: &PublishRequest,
        shutdown: &Shutdown,
    ) -> Result<(), PipelineError> {
        if shutdown.is_triggered() {
            return Err(PipelineError::Cancelled);
        }

        let outcome = self.service.attempt_publish(request, shutdown).await?;

        info!(
            request_id = %request.id,
            ref_id = %outcome.ref_id,
            result = ?outcome.result_type(),
            load_id = ?outcome.load_id(),
            "publish_attempt_complete"
        );

        match TerminalOutcome::from_outcome(&outcome) {
            Some(terminal) => self.sink.completed(terminal).await,
            None => {
                let update = StatusUpdateRequest::from_publish(request, outcome.ref_id);
                self.status_producer.publish(&update).await?;

                info!(
                    request_id = %request.id,
                    ref_id = %update.ref_id,
                    queue = %self.status_producer.binding().queue_name,
                    "status_update_enqueued"
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<T: Transport> MessageHandler for PublishHandler<T> {
    async fn handle(&self, delivery: &Delivery, shutdown: &Shutdown) -> Disposition {
        let delivery_tag = delivery.delivery_tag;

        let request = match PublishRequest::decode(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    delivery_tag = delivery_tag,
                    error = %e,
                    body_preview = %body_preview(&delivery.body),
                    "publish_request_parse_failed"
                );
                self.on_error(&e, delivery_tag);
                // Redelivering the same bytes cannot succeed
                return Disposition::Reject;
            }
        };

        if exceeds_delivery_budget(delivery, self.max_retry_count) {
            warn!(
                request_id = %request.id,
                delivery_count = ?delivery.delivery_count,
                max_retry_count = self.max_retry_count,
                "publish_request_retry_exhausted"
            );
            self.sink
                .completed(TerminalOutcome::retry_exhausted(request.id.to_string()))
                .await;
            return Disposition::Reject;
        }

        match self.process(&request, shutdown).await {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                error!(
                    request_id = %request.id,
                    delivery_tag = delivery_tag,
                    error = %e,
                    "publish_request_failed"
                );
                self.on_error(&e, delivery_tag);
                Disposition::Requeue
            }
        }
    }
}
