//! In-memory transport for testing and single-process runs.
//!
//! Each queue name maps to a FIFO of ready messages plus the set of
//! deliveries awaiting ack. Competing consumers on the same queue each take
//! the next ready message; nacked messages go back to the tail (requeue) or
//! into the queue's dead-letter list (reject). Exchanges and routing keys are
//! ignored: a binding publishes straight into its `queue_name`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::debug;

use super::{ConsumerChannel, Delivery, OutboundMessage, Transport};
use crate::config::QueueBinding;
use crate::error::PipelineError;

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Vec<u8>,
    /// Deliveries so far
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    /// Every body ever published to the queue, delayed or not
    published: Vec<Vec<u8>>,
    acked: usize,
    dead_letters: Vec<Vec<u8>>,
}

#[derive(Default)]
struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, message: StoredMessage) {
        self.lock().ready.push_back(message);
        self.notify.notify_one();
    }

    fn take_next(&self, tag: u64) -> Option<Delivery> {
        let mut state = self.lock();
        let mut message = state.ready.pop_front()?;

        let delivery = Delivery {
            delivery_tag: tag,
            message_id: Some(message.message_id.clone()),
            body: message.body.clone(),
            redelivered: message.deliveries > 0,
            delivery_count: Some(message.deliveries),
        };

        message.deliveries += 1;
        state.unacked.insert(tag, message);

        // Notify permits don't stack; pass the wakeup on to the next waiter
        if !state.ready.is_empty() {
            self.notify.notify_one();
        }

        Some(delivery)
    }
}

/// Thread-safe in-memory broker. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    next_tag: AtomicU64,
    fail_publish: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        let mut queues = self
            .inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(name.to_string()).or_default())
    }

    /// Make every following publish fail with a transport error.
    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Put raw bytes on a queue, bypassing serialization.
    pub fn push_raw(&self, queue: &str, message_id: &str, body: Vec<u8>) {
        let queue = self.queue(queue);
        queue.lock().published.push(body.clone());
        queue.enqueue(StoredMessage {
            message_id: message_id.to_string(),
            body,
            deliveries: 0,
        });
    }

    /// Bodies of every message published to `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queue(queue).lock().published.clone()
    }

    /// Published messages decoded as `T`; undecodable bodies are skipped.
    pub fn published_as<T: DeserializeOwned>(&self, queue: &str) -> Vec<T> {
        self.published(queue)
            .iter()
            .filter_map(|body| serde_json::from_slice(body).ok())
            .collect()
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.queue(queue).lock().ready.len()
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.queue(queue).lock().unacked.len()
    }

    pub fn acked_count(&self, queue: &str) -> usize {
        self.queue(queue).lock().acked
    }

    /// Bodies rejected without requeue.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queue(queue).lock().dead_letters.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Channel = MemoryConsumer;

    async fn publish(
        &self,
        binding: &QueueBinding,
        message: OutboundMessage,
    ) -> Result<(), PipelineError> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(PipelineError::Transport("memory transport publish failure".to_string()));
        }

        let queue = self.queue(&binding.queue_name);
        queue.lock().published.push(message.body.clone());

        let stored = StoredMessage {
            message_id: message.message_id,
            body: message.body,
            deliveries: 0,
        };

        match message.delay {
            Some(delay) => {
                debug!(
                    queue = %binding.queue_name,
                    delay_ms = delay.as_millis() as u64,
                    "memory_publish_delayed"
                );
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.enqueue(stored);
                });
            }
            None => queue.enqueue(stored),
        }

        Ok(())
    }

    async fn open_consumer(
        &self,
        binding: &QueueBinding,
        consumer_tag: &str,
    ) -> Result<MemoryConsumer, PipelineError> {
        debug!(queue = %binding.queue_name, consumer_tag = consumer_tag, "memory_consumer_opened");

        Ok(MemoryConsumer {
            queue: self.queue(&binding.queue_name),
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Consumer over one in-memory queue.
pub struct MemoryConsumer {
    queue: Arc<MemoryQueue>,
    inner: Arc<MemoryInner>,
}

impl MemoryConsumer {
    fn take_unacked(&self, delivery_tag: u64) -> Result<StoredMessage, PipelineError> {
        self.queue
            .lock()
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| PipelineError::Transport(format!("unknown delivery tag {delivery_tag}")))
    }
}

#[async_trait]
impl ConsumerChannel for MemoryConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, PipelineError>> {
        loop {
            let notified = self.queue.notify.notified();

            let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(delivery) = self.queue.take_next(tag) {
                return Some(Ok(delivery));
            }

            notified.await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        self.take_unacked(delivery_tag)?;
        self.queue.lock().acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), PipelineError> {
        let message = self.take_unacked(delivery_tag)?;

        if requeue {
            self.queue.enqueue(message);
        } else {
            self.queue.lock().dead_letters.push(message.body);
        }

        Ok(())
    }
}
