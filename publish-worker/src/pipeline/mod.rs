//! Per-message handlers for the two queues.
//!
//! ## Processing Flow
//!
//! ```text
//! PublishRequest ─attempt_publish─▶ Succeeded/Failed ─▶ OutcomeSink
//!                                 └▶ Processing ─▶ StatusUpdateRequest
//! StatusUpdateRequest ─poll_status─▶ Succeeded/Failed ─▶ OutcomeSink
//!                                  └▶ Processing ─▶ retry (attempt + 1) or RetryExhausted
//! ```

pub mod publish;
pub mod status;

use std::borrow::Cow;

use crate::broker::Delivery;

pub use publish::PublishHandler;
pub use status::StatusHandler;

/// Whether the broker has redelivered this message more often than the
/// binding's retry budget allows. A budget of 0 means unbounded.
pub(crate) fn exceeds_delivery_budget(delivery: &Delivery, max_retry_count: u32) -> bool {
    max_retry_count > 0
        && delivery
            .delivery_count
            .is_some_and(|count| count > max_retry_count)
}

/// First 500 bytes of a body, for logging undecodable messages.
pub(crate) fn body_preview(body: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(&body[..body.len().min(500)])
}
