//! RabbitMQ transport built on lapin.
//!
//! One connection is shared by the whole process. Publishing goes through a
//! single confirm-mode channel that is reopened on failure; every consumer
//! gets its own channel from [`AmqpTransport::open_consumer`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::{ConsumerChannel, Delivery, OutboundMessage, Transport};
use crate::config::QueueBinding;
use crate::error::PipelineError;

/// Header quorum queues use to count deliveries.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

const QUEUE_TYPE_ARGUMENT: &str = "x-queue-type";

/// Async RabbitMQ transport with connection management.
///
/// The transport keeps a persistent connection and publishing channel,
/// reconnecting on the next call after a failure.
#[derive(Clone)]
pub struct AmqpTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    url: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    /// Queues whose topology the publishing channel already declared
    declared: Mutex<HashSet<String>>,
}

fn transport_error(context: &'static str) -> impl FnOnce(lapin::Error) -> PipelineError {
    move |e| PipelineError::Transport(format!("{context}: {e}"))
}

impl AmqpTransport {
    /// Create a new transport for the given RabbitMQ URL.
    ///
    /// No connection is made until the first publish or consumer.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                url: url.into(),
                connection: RwLock::new(None),
                channel: RwLock::new(None),
                declared: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Connect eagerly so startup fails fast on an unreachable broker.
    pub async fn connect(&self) -> Result<(), PipelineError> {
        let mut connection = self.inner.connection.write().await;
        self.ensure_connection(&mut connection).await
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<Connection>,
    ) -> Result<(), PipelineError> {
        if let Some(conn) = connection.as_ref() {
            if conn.status().connected() {
                return Ok(());
            }
        }

        info!("rabbitmq_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .map_err(transport_error("Failed to connect to RabbitMQ"))?;

        info!("rabbitmq_connected");

        *connection = Some(conn);
        Ok(())
    }

    async fn create_channel(&self) -> Result<Channel, PipelineError> {
        let mut connection = self.inner.connection.write().await;
        self.ensure_connection(&mut connection).await?;

        match connection.as_ref() {
            Some(conn) => conn
                .create_channel()
                .await
                .map_err(transport_error("Failed to create channel")),
            None => Err(PipelineError::Transport("connection unavailable".to_string())),
        }
    }

    /// Ensure we have a valid publishing channel.
    async fn publish_channel(&self) -> Result<Channel, PipelineError> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        let ch = self.create_channel().await?;
        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(transport_error("Failed to enable publisher confirms"))?;

        info!("rabbitmq_publisher_channel_created");

        self.inner.declared.lock().await.clear();
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Declare the binding's topology on the publishing channel once.
    async fn ensure_declared(
        &self,
        channel: &Channel,
        binding: &QueueBinding,
    ) -> Result<(), PipelineError> {
        let mut declared = self.inner.declared.lock().await;
        if declared.contains(&binding.queue_name) {
            return Ok(());
        }

        declare_topology(channel, binding).await?;
        declared.insert(binding.queue_name.clone());
        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut channel = self.inner.channel.write().await;
        let mut connection = self.inner.connection.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_transport_closed");
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    type Channel = AmqpConsumer;

    async fn publish(
        &self,
        binding: &QueueBinding,
        message: OutboundMessage,
    ) -> Result<(), PipelineError> {
        let channel = self.publish_channel().await?;
        self.ensure_declared(&channel, binding).await?;

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into())
            .with_message_id(message.message_id.clone().into());

        // Delayed messages wait in the delay queue until their TTL expires,
        // then dead-letter into the binding's exchange.
        let (exchange, routing_key) = match message.delay {
            Some(delay) => {
                properties =
                    properties.with_expiration(delay.as_millis().to_string().into());
                (String::new(), binding.delay_queue_name())
            }
            None => (
                binding.exchange_name.clone(),
                binding.effective_routing_key().to_string(),
            ),
        };

        channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(transport_error("Failed to publish"))?
            .await
            .map_err(transport_error("Failed to confirm publish"))?;

        info!(
            queue = %binding.queue_name,
            message_id = %message.message_id,
            body_length = message.body.len(),
            delay_ms = message.delay.map(|d| d.as_millis() as u64),
            "rabbitmq_message_published"
        );

        Ok(())
    }

    async fn open_consumer(
        &self,
        binding: &QueueBinding,
        consumer_tag: &str,
    ) -> Result<AmqpConsumer, PipelineError> {
        let channel = self.create_channel().await?;

        channel
            .basic_qos(binding.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(transport_error("Failed to set QoS"))?;

        declare_topology(&channel, binding).await?;

        let consumer = channel
            .basic_consume(
                &binding.queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error("Failed to start consumer"))?;

        info!(
            queue = %binding.queue_name,
            consumer_tag = consumer_tag,
            prefetch_count = binding.prefetch_count,
            "rabbitmq_consumer_started"
        );

        Ok(AmqpConsumer { channel, consumer })
    }
}

/// Declare exchange, queue, binding and (when delays are on) the delay queue.
///
/// All declarations are idempotent and durable.
async fn declare_topology(channel: &Channel, binding: &QueueBinding) -> Result<(), PipelineError> {
    if !binding.exchange_name.is_empty() {
        channel
            .exchange_declare(
                &binding.exchange_name,
                exchange_kind(&binding.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error("Failed to declare exchange"))?;
    }

    if binding.max_retry_count > 0 && !binding.queue_type.eq_ignore_ascii_case("quorum") {
        warn!(
            queue = %binding.queue_name,
            queue_type = %binding.queue_type,
            "queue_type_without_delivery_count"
        );
    }

    channel
        .queue_declare(
            &binding.queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            queue_arguments(binding),
        )
        .await
        .map_err(transport_error("Failed to declare queue"))?;

    if !binding.exchange_name.is_empty() {
        channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error("Failed to bind queue"))?;
    }

    if binding.with_delay {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(binding.exchange_name.as_str().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(binding.effective_routing_key().into()),
        );

        channel
            .queue_declare(
                &binding.delay_queue_name(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(transport_error("Failed to declare delay queue"))?;
    }

    info!(
        queue = %binding.queue_name,
        exchange = %binding.exchange_name,
        routing_key = %binding.effective_routing_key(),
        with_delay = binding.with_delay,
        "rabbitmq_topology_declared"
    );

    Ok(())
}

/// Declaration arguments of the binding's main queue.
fn queue_arguments(binding: &QueueBinding) -> FieldTable {
    let mut args = FieldTable::default();
    if !binding.queue_type.is_empty() {
        args.insert(
            QUEUE_TYPE_ARGUMENT.into(),
            AMQPValue::LongString(binding.queue_type.as_str().into()),
        );
    }
    args
}

fn exchange_kind(name: &str) -> ExchangeKind {
    match name.to_ascii_lowercase().as_str() {
        "direct" | "" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Read the broker-maintained delivery count, if the queue type provides one.
fn delivery_count(headers: Option<&FieldTable>) -> Option<u32> {
    let value = headers?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
        .map(|(_, value)| value)?;

    let count = match value {
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    u32::try_from(count).ok()
}

/// A consumer bound to its own lapin channel.
pub struct AmqpConsumer {
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl ConsumerChannel for AmqpConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, PipelineError>> {
        let delivery = self.consumer.next().await?;

        Some(
            delivery
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    message_id: delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|s| s.as_str().to_string()),
                    redelivered: delivery.redelivered,
                    delivery_count: delivery_count(delivery.properties.headers().as_ref()),
                    body: delivery.data,
                })
                .map_err(transport_error("Delivery error")),
        )
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(transport_error("Failed to ack"))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), PipelineError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(transport_error("Failed to nack"))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        self.channel
            .close(200, "Normal shutdown")
            .await
            .map_err(transport_error("Failed to close channel"))
    }
}
