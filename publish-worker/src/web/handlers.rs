//! Ingress endpoint handlers.
//!
//! These handlers only build [`PublishRequest`]s and enqueue them; all
//! publication work happens in the worker.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::broker::Transport;
use crate::queue::{DocumentOneInput, DocumentType, Producer, PublishRequest, UserInputData};

/// Default number of requests enqueued by the bulk endpoint.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Shared application state.
pub struct AppState<T: Transport> {
    pub producer: Producer<T>,
}

impl<T: Transport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
        }
    }
}

impl<T: Transport> AppState<T> {
    pub fn new(producer: Producer<T>) -> Self {
        Self { producer }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Enqueue endpoints
// =============================================================================

/// Enqueue response.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub status: String,
    pub enqueued: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct BatchParams {
    pub count: Option<usize>,
}

/// Sample request number `i` of a bulk batch.
pub fn sample_request(i: i64) -> PublishRequest {
    PublishRequest {
        id: Uuid::new_v4(),
        document_id: i,
        document_revision: i + 155,
        document_type: DocumentType::One,
        organization_id: i,
        user_id: i,
        user_input_data: sample_input(),
    }
}

/// Fixed sample request carrying a caller-chosen correlation id.
pub fn single_request(id: Uuid) -> PublishRequest {
    PublishRequest {
        id,
        document_id: 512,
        document_revision: 1155,
        document_type: DocumentType::One,
        organization_id: 21,
        user_id: 5,
        user_input_data: sample_input(),
    }
}

fn sample_input() -> UserInputData {
    UserInputData::One(DocumentOneInput {
        login: "1".to_string(),
        password: "test".to_string(),
        registry_number: "4".to_string(),
    })
}

/// Bulk endpoint: enqueue `count` sample publish requests.
pub async fn publish_many<T: Transport>(
    State(state): State<AppState<T>>,
    Query(params): Query<BatchParams>,
) -> impl IntoResponse {
    let count = params.count.unwrap_or(DEFAULT_BATCH_SIZE);
    info!(count = count, "publish_many_received");

    for i in 0..count {
        let request = sample_request(i as i64);
        if let Err(e) = state.producer.publish(&request).await {
            error!(error = %e, enqueued = i, "publish_many_failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(EnqueueResponse {
                    status: "error".to_string(),
                    enqueued: i,
                    id: None,
                }),
            );
        }
    }

    info!(count = count, "publish_many_enqueued");

    (
        StatusCode::OK,
        Json(EnqueueResponse {
            status: "enqueued".to_string(),
            enqueued: count,
            id: None,
        }),
    )
}

/// Single endpoint: enqueue one publish request with the given id.
pub async fn publish_single<T: Transport>(
    State(state): State<AppState<T>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    info!(request_id = %id, "publish_single_received");

    if let Err(e) = state.producer.publish(&single_request(id)).await {
        error!(request_id = %id, error = %e, "publish_single_failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(EnqueueResponse {
                status: "error".to_string(),
                enqueued: 0,
                id: Some(id),
            }),
        );
    }

    info!(request_id = %id, "publish_single_enqueued");

    (
        StatusCode::OK,
        Json(EnqueueResponse {
            status: "enqueued".to_string(),
            enqueued: 1,
            id: Some(id),
        }),
    )
}
