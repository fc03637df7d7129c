//! DocPub API - ingress for publish requests.
//!
//! This binary provides a thin web server that builds publish requests and
//! enqueues them on the publish queue. All publication work happens in the
//! worker.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docpub::broker::AmqpTransport;
use docpub::shutdown::{self, listen_for_signals};
use docpub::web::{router, AppState};
use docpub::{Config, Producer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("api_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        publish_queue = %config.publish.queue_name,
        publish_exchange = %config.publish.exchange_name,
        "config_loaded"
    );

    // Create RabbitMQ producer for the publish queue
    let transport = Arc::new(AmqpTransport::new(config.publish.connection_string.clone()));
    let producer = Producer::new(Arc::clone(&transport), Arc::new(config.publish.clone()));
    info!("rabbitmq_producer_created");

    let app = router(AppState::new(producer));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "api_server_listening");

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(listen_for_signals(trigger));

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
        .context("Server error")?;

    // Close broker connection
    transport.close().await;

    info!("api_server_shutdown_complete");

    Ok(())
}
