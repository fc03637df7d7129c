//! Error types shared by the producer, transports and pipelines.

use thiserror::Error;

use crate::queue::DocumentType;

/// Errors raised while moving a message through the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The broker could not be reached or a channel operation failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The message body is not valid JSON for the expected schema.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `documentType` and the user input payload disagree.
    #[error("payload does not match document type: expected {expected:?}, got {actual:?}")]
    PayloadMismatch {
        expected: DocumentType,
        actual: DocumentType,
    },

    /// The publish/poll operation against the external system failed.
    #[error("publication attempt failed: {0}")]
    Attempt(String),

    /// The shutdown signal fired while an operation was in flight.
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

impl PipelineError {
    /// Whether retrying the same bytes can ever succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PipelineError::Serialization(_) | PipelineError::PayloadMismatch { .. }
        )
    }
}

impl From<lapin::Error> for PipelineError {
    fn from(err: lapin::Error) -> Self {
        PipelineError::Transport(err.to_string())
    }
}
