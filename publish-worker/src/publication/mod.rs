//! The external publication system, as seen by the pipeline.
//!
//! - [`PublicationService`]: attempt a publication and poll its status
//! - [`OutcomeSink`]: receives terminal outcomes
//!
//! Both are injected into the pipelines at pool start, so tests can supply
//! deterministic stubs.

pub mod simulated;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::queue::{PublicationOutcome, PublicationResult, PublishRequest, StatusUpdateRequest};
use crate::shutdown::Shutdown;

pub use simulated::SimulatedPublisher;

/// Capability to talk to the external publication system.
///
/// Both operations may be invoked more than once for the same request, since
/// a nack causes redelivery; implementations must be idempotent. They should
/// return [`PipelineError::Cancelled`] when `shutdown` fires mid-flight.
#[async_trait]
pub trait PublicationService: Send + Sync + 'static {
    /// Submit the document. `Processing` means accepted but not yet final.
    async fn attempt_publish(
        &self,
        request: &PublishRequest,
        shutdown: &Shutdown,
    ) -> Result<PublicationOutcome, PipelineError>;

    /// Ask for the current status of a previously accepted publication.
    async fn poll_status(
        &self,
        request: &StatusUpdateRequest,
        shutdown: &Shutdown,
    ) -> Result<PublicationOutcome, PipelineError>;
}

/// Why a publication ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The external system reported the publication as failed
    Rejected,
    /// Status polling ran out of retries
    RetryExhausted,
}

/// Final state of a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalResult {
    Succeeded { load_id: i64 },
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOutcome {
    pub ref_id: String,
    pub result: TerminalResult,
}

impl TerminalOutcome {
    /// Convert a final outcome from the external system; `None` while it is
    /// still processing.
    pub fn from_outcome(outcome: &PublicationOutcome) -> Option<Self> {
        let result = match outcome.result {
            PublicationResult::Succeeded { load_id } => TerminalResult::Succeeded { load_id },
            PublicationResult::Failed => TerminalResult::Failed {
                reason: FailureReason::Rejected,
            },
            PublicationResult::Processing => return None,
        };

        Some(Self {
            ref_id: outcome.ref_id.clone(),
            result,
        })
    }

    pub fn retry_exhausted(ref_id: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            result: TerminalResult::Failed {
                reason: FailureReason::RetryExhausted,
            },
        }
    }
}

/// Receives terminal outcomes (document status update, user notification).
#[async_trait]
pub trait OutcomeSink: Send + Sync + 'static {
    async fn completed(&self, outcome: TerminalOutcome);
}

/// Sink that only records outcomes in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl OutcomeSink for LogSink {
    async fn completed(&self, outcome: TerminalOutcome) {
        match outcome.result {
            TerminalResult::Succeeded { load_id } => info!(
                ref_id = %outcome.ref_id,
                load_id = load_id,
                "publication_succeeded"
            ),
            TerminalResult::Failed { reason } => warn!(
                ref_id = %outcome.ref_id,
                reason = ?reason,
                "publication_failed"
            ),
        }
    }
}
