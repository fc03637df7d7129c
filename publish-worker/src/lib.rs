//! DocPub - reliable document publication over RabbitMQ.
//!
//! This library provides shared modules for the two DocPub binaries:
//! - `docpub-api`: Thin web server that enqueues publish requests
//! - `docpub-worker`: Publish and status-update consumer pools
//!
//! ## Architecture
//!
//! ```text
//! API → publish queue → Publish pool ─(Processing)→ status-update queue → Status pool
//!                            │                                                │
//!                            └──────────── terminal outcome ◀─────────────────┘
//! ```
//!
//! Delivery is at-least-once: a nacked message is redelivered by the broker,
//! so the publication service must be idempotent.

pub mod broker;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod publication;
pub mod queue;
pub mod shutdown;
pub mod web;

// Re-export commonly used types
pub use config::{Config, QueueBinding};
pub use error::PipelineError;
pub use queue::{
    DocumentType, Producer, PublicationOutcome, PublicationResult, PublishRequest, ResultType,
    StatusUpdateRequest, UserInputData,
};
