//! Queue message types for the two-queue architecture.
//!
//! This module defines the message formats for:
//! - the publish queue: [`PublishRequest`] from the ingress
//! - the status-update queue: [`StatusUpdateRequest`] for pending publications
//!
//! and the [`PublicationOutcome`] record returned by the external system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// A message that can be published through a [`Producer`](super::Producer).
pub trait QueueMessage: Serialize {
    /// Message id stamped on the AMQP properties for tracing.
    fn message_id(&self) -> String;
}

// =============================================================================
// Document payloads
// =============================================================================

/// Closed set of document kinds the external system accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    One,
    Two,
}

/// Credentials and document-specific fields entered by the user.
///
/// The variant must match the request's [`DocumentType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum UserInputData {
    One(DocumentOneInput),
    Two(DocumentTwoInput),
}

impl UserInputData {
    /// The document type this payload belongs to.
    pub fn document_type(&self) -> DocumentType {
        match self {
            UserInputData::One(_) => DocumentType::One,
            UserInputData::Two(_) => DocumentType::Two,
        }
    }

    pub fn login(&self) -> &str {
        match self {
            UserInputData::One(d) => &d.login,
            UserInputData::Two(d) => &d.login,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentOneInput {
    pub login: String,
    pub password: String,
    pub registry_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentTwoInput {
    pub login: String,
    pub password: String,
    pub registry_number: String,
}

/// Identifies one revision of one organization's document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionIdentity {
    pub document_id: i64,
    pub document_revision: i64,
    pub organization_id: i64,
}

// =============================================================================
// Publish queue
// =============================================================================

/// Request to publish one document revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    /// Correlation id, unique per request
    pub id: Uuid,
    pub document_id: i64,
    pub document_revision: i64,
    pub document_type: DocumentType,
    pub organization_id: i64,
    pub user_id: i64,
    pub user_input_data: UserInputData,
}

impl PublishRequest {
    /// Decode a publish-queue body, rejecting payloads that don't match
    /// their document type.
    pub fn decode(body: &[u8]) -> Result<Self, PipelineError> {
        let request: PublishRequest = serde_json::from_slice(body)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let actual = self.user_input_data.document_type();
        if actual != self.document_type {
            return Err(PipelineError::PayloadMismatch {
                expected: self.document_type,
                actual,
            });
        }
        Ok(())
    }

    pub fn revision_identity(&self) -> RevisionIdentity {
        RevisionIdentity {
            document_id: self.document_id,
            document_revision: self.document_revision,
            organization_id: self.organization_id,
        }
    }
}

impl QueueMessage for PublishRequest {
    fn message_id(&self) -> String {
        self.id.to_string()
    }
}

// =============================================================================
// Status-update queue
// =============================================================================

/// Request to poll the external system for a pending publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    /// Correlation id of the originating publish attempt
    pub ref_id: String,
    pub user_id: i64,
    pub document_type: DocumentType,
    pub revision_identity: RevisionIdentity,
    pub user_data: UserInputData,
    pub timestamp: DateTime<Utc>,
    /// Number of polls already spent on this reference
    pub attempt_count: u32,
}

impl StatusUpdateRequest {
    /// First status-update request for a publication the external system
    /// reported as still processing.
    pub fn from_publish(request: &PublishRequest, ref_id: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            user_id: request.user_id,
            document_type: request.document_type,
            revision_identity: request.revision_identity(),
            user_data: request.user_input_data.clone(),
            timestamp: Utc::now(),
            attempt_count: 0,
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, PipelineError> {
        let request: StatusUpdateRequest = serde_json::from_slice(body)?;
        let actual = request.user_data.document_type();
        if actual != request.document_type {
            return Err(PipelineError::PayloadMismatch {
                expected: request.document_type,
                actual,
            });
        }
        Ok(request)
    }

    /// The request for the following poll.
    pub fn next_attempt(&self) -> Self {
        Self {
            timestamp: Utc::now(),
            attempt_count: self.attempt_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Whether another poll would exceed `max_retry_count`.
    ///
    /// `attempt_count` comes off the wire, so the increment saturates.
    pub fn is_exhausted(&self, max_retry_count: u32) -> bool {
        self.attempt_count.saturating_add(1) > max_retry_count
    }
}

impl QueueMessage for StatusUpdateRequest {
    fn message_id(&self) -> String {
        format!("{}-{}", self.ref_id, self.attempt_count)
    }
}

// =============================================================================
// Publication results
// =============================================================================

/// Classification of a publish attempt or status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Succeeded,
    Failed,
    Processing,
}

/// Result reported by the external system. Only a success carries a load id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resultType", rename_all = "camelCase")]
pub enum PublicationResult {
    #[serde(rename_all = "camelCase")]
    Succeeded { load_id: i64 },
    Failed,
    Processing,
}

/// Outcome of one call to the external system for a given reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationOutcome {
    pub ref_id: String,
    #[serde(flatten)]
    pub result: PublicationResult,
}

impl PublicationOutcome {
    pub fn succeeded(ref_id: impl Into<String>, load_id: i64) -> Self {
        Self {
            ref_id: ref_id.into(),
            result: PublicationResult::Succeeded { load_id },
        }
    }

    pub fn failed(ref_id: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            result: PublicationResult::Failed,
        }
    }

    pub fn processing(ref_id: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            result: PublicationResult::Processing,
        }
    }

    pub fn result_type(&self) -> ResultType {
        match self.result {
            PublicationResult::Succeeded { .. } => ResultType::Succeeded,
            PublicationResult::Failed => ResultType::Failed,
            PublicationResult::Processing => ResultType::Processing,
        }
    }

    pub fn load_id(&self) -> Option<i64> {
        match self.result {
            PublicationResult::Succeeded { load_id } => Some(load_id),
            _ => None,
        }
    }
}
