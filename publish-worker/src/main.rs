//! DocPub Worker - async RabbitMQ consumers for document publication.
//!
//! This worker drains the publish queue (first publication attempt) and the
//! status-update queue (polling until the external system reports a final
//! result), each with its own pool of competing consumers.

mod consumer;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docpub::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        publish_queue = %config.publish.queue_name,
        publish_consumers = config.publish.consumer_count,
        publish_max_retry_count = config.publish.max_retry_count,
        status_queue = %config.status_update.queue_name,
        status_consumers = config.status_update.consumer_count,
        status_max_retry_count = config.status_update.max_retry_count,
        status_retry_delay_secs = ?config.status_update.retry_delay().map(|d| d.as_secs()),
        "config_loaded"
    );

    consumer::run(config).await?;

    Ok(())
}
