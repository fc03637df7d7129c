//! Handler for the status-update queue.
//!
//! Every delivery is one poll. While the external system keeps answering
//! `Processing`, the request is re-published with `attempt_count + 1` (after
//! the binding's retry delay) until the retry budget runs out.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{body_preview, exceeds_delivery_budget};
use crate::broker::{Delivery, Disposition, Transport};
use crate::error::PipelineError;
use crate::pool::MessageHandler;
use crate::publication::{OutcomeSink, PublicationService, TerminalOutcome};
use crate::queue::{Producer, StatusUpdateRequest};
use crate::shutdown::Shutdown;

/// Consumes [`StatusUpdateRequest`]s.
///
/// The producer must target the status-update binding itself: its
/// `max_retry_count`, `with_delay` and `retry_delay` drive the retries.
pub struct StatusHandler<T: Transport> {
    service: Arc<dyn PublicationService>,
    producer: Producer<T>,
    sink: Arc<dyn OutcomeSink>,
}

impl<T: Transport> StatusHandler<T> {
    pub fn new(
        service: Arc<dyn PublicationService>,
        producer: Producer<T>,
        sink: Arc<dyn OutcomeSink>,
    ) -> Self {
        Self {
            service,
            producer,
            sink,
        }
    }

    async fn process(
        &self,
        request: &StatusUpdateRequest,
        shutdown: &Shutdown,
    ) -> Result<(), PipelineError> {
        if shutdown.is_triggered() {
            return Err(PipelineError::Cancelled);
        }

        let outcome = self.service.poll_status(request, shutdown).await?;

        info!(
            ref_id = %request.ref_id,
            attempt = request.attempt_count,
            result = ?outcome.result_type(),
            load_id = ?outcome.load_id(),
            "status_poll_complete"
        );

        if let Some(terminal) = TerminalOutcome::from_outcome(&outcome) {
            self.sink.completed(terminal).await;
            return Ok(());
        }

        let binding = self.producer.binding();

        if request.is_exhausted(binding.max_retry_count) {
            warn!(
                ref_id = %request.ref_id,
                attempt = request.attempt_count,
                max_retry_count = binding.max_retry_count,
                "status_retry_exhausted"
            );
            self.sink
                .completed(TerminalOutcome::retry_exhausted(request.ref_id.clone()))
                .await;
            return Ok(());
        }

        let next = request.next_attempt();
        let delay = binding.retry_delay();
        self.producer.publish_delayed(&next, delay).await?;

        info!(
            ref_id = %next.ref_id,
            attempt = next.attempt_count,
            delay_secs = delay.map(|d| d.as_secs()),
            "status_update_rescheduled"
        );

        Ok(())
    }
}

#[async_trait]
impl<T: Transport> MessageHandler for StatusHandler<T> {
    async fn handle(&self, delivery: &Delivery, shutdown: &Shutdown) -> Disposition {
        let delivery_tag = delivery.delivery_tag;

        let request = match StatusUpdateRequest::decode(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    delivery_tag = delivery_tag,
                    error = %e,
                    body_preview = %body_preview(&delivery.body),
                    "status_update_parse_failed"
                );
                self.on_error(&e, delivery_tag);
                return Disposition::Reject;
            }
        };

        let max_retry_count = self.producer.binding().max_retry_count;
        if exceeds_delivery_budget(delivery, max_retry_count) {
            warn!(
                ref_id = %request.ref_id,
                delivery_count = ?delivery.delivery_count,
                "status_update_redelivery_exhausted"
            );
            self.sink
                .completed(TerminalOutcome::retry_exhausted(request.ref_id.clone()))
                .await;
            return Disposition::Reject;
        }

        match self.process(&request, shutdown).await {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                error!(
                    ref_id = %request.ref_id,
                    delivery_tag = delivery_tag,
                    error = %e,
                    "status_update_failed"
                );
                self.on_error(&e, delivery_tag);
                Disposition::Requeue
            }
        }
    }
}
