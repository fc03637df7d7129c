//! Worker wiring: transports, handlers and both consumer pools.
//!
//! Every dependency is built once here and moved into the pools, which share
//! it across their consumers.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use docpub::broker::AmqpTransport;
use docpub::pipeline::{PublishHandler, StatusHandler};
use docpub::publication::{LogSink, OutcomeSink, PublicationService, SimulatedPublisher};
use docpub::shutdown::{self, listen_for_signals};
use docpub::{pool, Config, Producer};

/// Run the publish and status-update pools until SIGINT/SIGTERM.
///
/// This function:
/// 1. Connects to RabbitMQ for each binding (shared when the URLs match)
/// 2. Builds the publication service, outcome sink and status producer
/// 3. Starts `consumer_count` consumers per queue
/// 4. Waits for both pools to drain after a shutdown signal
pub async fn run(config: Config) -> Result<()> {
    let publish_binding = Arc::new(config.publish);
    let status_binding = Arc::new(config.status_update);

    let publish_transport = Arc::new(AmqpTransport::new(
        publish_binding.connection_string.clone(),
    ));
    let status_transport =
        if status_binding.connection_string == publish_binding.connection_string {
            Arc::clone(&publish_transport)
        } else {
            Arc::new(AmqpTransport::new(status_binding.connection_string.clone()))
        };

    publish_transport
        .connect()
        .await
        .context("Failed to connect to RabbitMQ for the publish queue")?;
    status_transport
        .connect()
        .await
        .context("Failed to connect to RabbitMQ for the status-update queue")?;

    let service: Arc<dyn PublicationService> =
        Arc::new(SimulatedPublisher::new(config.simulated_latency_ms));
    let sink: Arc<dyn OutcomeSink> = Arc::new(LogSink);

    let status_producer = Producer::new(Arc::clone(&status_transport), Arc::clone(&status_binding));

    let publish_handler = Arc::new(PublishHandler::new(
        Arc::clone(&service),
        status_producer.clone(),
        Arc::clone(&sink),
        publish_binding.max_retry_count,
    ));
    let status_handler = Arc::new(StatusHandler::new(service, status_producer, sink));

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(listen_for_signals(trigger));

    info!("worker_ready");

    // A failed pool stops the worker; the other pool is dropped with it
    let result = tokio::try_join!(
        pool::run(
            "publish",
            Arc::clone(&publish_transport),
            Arc::clone(&publish_binding),
            publish_handler,
            shutdown.clone(),
        ),
        pool::run(
            "status_update",
            Arc::clone(&status_transport),
            Arc::clone(&status_binding),
            status_handler,
            shutdown,
        ),
    );

    publish_transport.close().await;
    if !Arc::ptr_eq(&publish_transport, &status_transport) {
        status_transport.close().await;
    }

    result.context("Consumer pool ended abnormally")?;

    info!("worker_shutdown_complete");
    Ok(())
}
