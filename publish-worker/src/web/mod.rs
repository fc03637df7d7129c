//! Ingress web server module.
//!
//! A thin HTTP surface that builds sample publish requests and enqueues them
//! on the publish queue. It carries no retry or state-machine logic.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::broker::Transport;

pub use handlers::{
    health, publish_many, publish_single, sample_request, single_request, AppState,
    BatchParams, EnqueueResponse, HealthResponse, DEFAULT_BATCH_SIZE,
};

/// Build the ingress router.
pub fn router<T: Transport>(state: AppState<T>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/document/many", post(publish_many::<T>))
        .route("/api/document/single/:id", post(publish_single::<T>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
