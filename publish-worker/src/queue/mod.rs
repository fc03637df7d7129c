//! Queue module for the two-queue publication pipeline.
//!
//! This module provides:
//! - Message types for the publish and status-update queues
//! - A typed producer for enqueueing messages
//!
//! ## Architecture
//!
//! ```text
//! Ingress → publish queue → Publish workers → status-update queue → Status workers
//! ```

pub mod producer;
pub mod types;

pub use producer::Producer;
pub use types::{
    DocumentOneInput, DocumentTwoInput, DocumentType, PublicationOutcome, PublicationResult,
    PublishRequest, QueueMessage, ResultType, RevisionIdentity, StatusUpdateRequest,
    UserInputData,
};
