//! Stand-in for the external publication system.
//!
//! Picks a random result for every call, after a random latency. Used by the
//! worker binary until a real registry client is plugged in.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info};

use super::PublicationService;
use crate::error::PipelineError;
use crate::queue::{PublicationOutcome, PublishRequest, StatusUpdateRequest};
use crate::shutdown::Shutdown;

/// Random-outcome publication service.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPublisher {
    /// Latency range in milliseconds (min, max)
    latency_ms: (u64, u64),
}

impl SimulatedPublisher {
    pub fn new(latency_ms: (u64, u64)) -> Self {
        Self { latency_ms }
    }

    async fn respond(
        &self,
        ref_id: &str,
        shutdown: &Shutdown,
    ) -> Result<PublicationOutcome, PipelineError> {
        if shutdown.is_triggered() {
            return Err(PipelineError::Cancelled);
        }

        // Generate all random values upfront (ThreadRng is not Send)
        let (delay_ms, roll, load_id) = {
            let mut rng = rand::thread_rng();
            let delay = rng.gen_range(self.latency_ms.0..=self.latency_ms.1);
            let roll: u8 = rng.gen_range(0..3);
            let load_id: i64 = rng.gen_range(1..i64::from(i32::MAX));
            (delay, roll, load_id)
        };

        tokio::select! {
            _ = shutdown.triggered() => return Err(PipelineError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {}
        }

        let outcome = match roll {
            0 => PublicationOutcome::succeeded(ref_id, load_id),
            1 => PublicationOutcome::failed(ref_id),
            _ => PublicationOutcome::processing(ref_id),
        };

        info!(
            ref_id = %ref_id,
            delay_ms = delay_ms,
            result = ?outcome.result_type(),
            "simulated_publication_response"
        );

        Ok(outcome)
    }
}

#[async_trait]
impl PublicationService for SimulatedPublisher {
    async fn attempt_publish(
        &self,
        request: &PublishRequest,
        shutdown: &Shutdown,
    ) -> Result<PublicationOutcome, PipelineError> {
        debug!(
            request_id = %request.id,
            document_type = ?request.document_type,
            login = request.user_input_data.login(),
            "simulated_publish_attempt"
        );
        self.respond(&request.id.to_string(), shutdown).await
    }

    async fn poll_status(
        &self,
        request: &StatusUpdateRequest,
        shutdown: &Shutdown,
    ) -> Result<PublicationOutcome, PipelineError> {
        debug!(
            ref_id = %request.ref_id,
            attempt = request.attempt_count,
            login = request.user_data.login(),
            "simulated_status_poll"
        );
        self.respond(&request.ref_id, shutdown).await
    }
}
