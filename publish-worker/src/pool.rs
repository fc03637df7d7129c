//! Competing-consumers worker pool.
//!
//! [`run`] spawns `consumer_count` long-lived tasks for one queue binding.
//! Each task opens its own channel, waits for deliveries one at a time, hands
//! them to the shared [`MessageHandler`] and settles them with the
//! [`Disposition`] it returns.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::broker::{ConsumerChannel, Delivery, Disposition, Transport};
use crate::config::QueueBinding;
use crate::error::PipelineError;
use crate::shutdown::Shutdown;

/// Per-message logic for one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one delivery and decide how to settle it.
    ///
    /// Errors must be turned into a [`Disposition`] here; nothing escapes
    /// the consumer.
    async fn handle(&self, delivery: &Delivery, shutdown: &Shutdown) -> Disposition;

    /// Observability hook for handler-level failures. Not for control flow.
    fn on_error(&self, error: &PipelineError, delivery_tag: u64) {
        error!(delivery_tag = delivery_tag, error = %error, "message_handler_error");
    }
}

/// Run a pool of consumers until shutdown.
///
/// A consumer that ends abnormally (failed to open its channel, lost its
/// consumer, or panicked) is fatal for the pool: the failure is logged as
/// soon as it happens, the sibling consumers are aborted and the error is
/// returned. Their unsettled deliveries go back to the broker.
pub async fn run<T, H>(
    name: &'static str,
    transport: Arc<T>,
    binding: Arc<QueueBinding>,
    handler: Arc<H>,
    shutdown: Shutdown,
) -> Result<(), PipelineError>
where
    T: Transport,
    H: MessageHandler,
{
    let consumer_count = binding.consumer_count.max(1);

    info!(
        pool = name,
        queue = %binding.queue_name,
        consumer_count = consumer_count,
        "pool_starting"
    );

    let mut consumers = JoinSet::new();
    for index in 0..consumer_count {
        let consumer_tag = format!("{name}-{index}");
        let task = consume(
            consumer_tag.clone(),
            Arc::clone(&transport),
            Arc::clone(&binding),
            Arc::clone(&handler),
            shutdown.clone(),
        );
        consumers.spawn(async move { (consumer_tag, task.await) });
    }

    while let Some(joined) = consumers.join_next().await {
        let failure = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((consumer_tag, Err(e))) => {
                error!(pool = name, consumer_tag = %consumer_tag, error = %e, "consumer_failed");
                format!("consumer {consumer_tag} failed: {e}")
            }
            Err(e) => {
                error!(pool = name, error = %e, "consumer_crashed");
                format!("consumer crashed: {e}")
            }
        };

        error!(pool = name, remaining = consumers.len(), "pool_aborting");
        consumers.shutdown().await;

        return Err(PipelineError::Transport(format!("{name} pool stopped: {failure}")));
    }

    info!(pool = name, "pool_stopped");
    Ok(())
}

/// One consumer slot: exclusive channel, one message at a time.
async fn consume<T, H>(
    consumer_tag: String,
    transport: Arc<T>,
    binding: Arc<QueueBinding>,
    handler: Arc<H>,
    shutdown: Shutdown,
) -> Result<(), PipelineError>
where
    T: Transport,
    H: MessageHandler,
{
    let mut channel = match transport.open_consumer(&binding, &consumer_tag).await {
        Ok(channel) => channel,
        Err(e) => {
            error!(
                consumer_tag = %consumer_tag,
                queue = %binding.queue_name,
                error = %e,
                "consumer_open_failed"
            );
            return Err(e);
        }
    };

    info!(consumer_tag = %consumer_tag, queue = %binding.queue_name, "consumer_ready");

    loop {
        if shutdown.is_triggered() {
            break;
        }

        let delivery = tokio::select! {
            _ = shutdown.triggered() => break,
            delivery = channel.next_delivery() => delivery,
        };

        match delivery {
            Some(Ok(delivery)) => {
                info!(
                    queue = %binding.queue_name,
                    consumer_tag = %consumer_tag,
                    message_id = delivery.message_id.as_deref().unwrap_or("unknown"),
                    delivery_tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    "message_received"
                );

                process(&channel, handler.as_ref(), &delivery, &shutdown).await;
            }
            Some(Err(e)) => {
                error!(consumer_tag = %consumer_tag, error = %e, "rabbitmq_delivery_error");
            }
            None => {
                if shutdown.is_triggered() {
                    break;
                }
                warn!(consumer_tag = %consumer_tag, "rabbitmq_consumer_closed");
                return Err(PipelineError::Transport(format!(
                    "consumer {consumer_tag} closed by broker"
                )));
            }
        }
    }

    if let Err(e) = channel.close().await {
        warn!(consumer_tag = %consumer_tag, error = %e, "consumer_channel_close_error");
    }

    info!(consumer_tag = %consumer_tag, "consumer_stopped");
    Ok(())
}

/// Run the handler on one delivery and settle it.
async fn process<C, H>(channel: &C, handler: &H, delivery: &Delivery, shutdown: &Shutdown)
where
    C: ConsumerChannel,
    H: MessageHandler,
{
    let delivery_tag = delivery.delivery_tag;

    let disposition = match AssertUnwindSafe(handler.handle(delivery, shutdown))
        .catch_unwind()
        .await
    {
        Ok(disposition) => disposition,
        Err(panic) => {
            let err =
                PipelineError::Attempt(format!("handler panicked: {}", panic_message(&*panic)));
            handler.on_error(&err, delivery_tag);
            Disposition::Requeue
        }
    };

    match channel.settle(delivery_tag, disposition).await {
        Ok(()) => info!(
            delivery_tag = delivery_tag,
            disposition = ?disposition,
            "message_settled"
        ),
        Err(e) => error!(
            delivery_tag = delivery_tag,
            disposition = ?disposition,
            error = %e,
            "rabbitmq_settle_failed"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
