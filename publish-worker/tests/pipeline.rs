//! End-to-end behaviour of the publish and status-update pipelines over the
//! in-memory transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Barrier;
use uuid::Uuid;

use docpub::broker::{Delivery, Disposition, MemoryTransport};
use docpub::pipeline::{PublishHandler, StatusHandler};
use docpub::pool::{self, MessageHandler};
use docpub::publication::{
    FailureReason, OutcomeSink, PublicationService, TerminalOutcome, TerminalResult,
};
use docpub::queue::{DocumentOneInput, DocumentType, UserInputData};
use docpub::shutdown::{self, Shutdown};
use docpub::{
    PipelineError, Producer, PublicationOutcome, PublishRequest, QueueBinding, StatusUpdateRequest,
};

const PUBLISH_QUEUE: &str = "document_publish";
const STATUS_QUEUE: &str = "document_publish_update";

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Reply {
    Succeeded(i64),
    Failed,
    Processing,
    Error,
}

impl Reply {
    fn into_outcome(self, ref_id: String) -> Result<PublicationOutcome, PipelineError> {
        match self {
            Reply::Succeeded(load_id) => Ok(PublicationOutcome::succeeded(ref_id, load_id)),
            Reply::Failed => Ok(PublicationOutcome::failed(ref_id)),
            Reply::Processing => Ok(PublicationOutcome::processing(ref_id)),
            Reply::Error => Err(PipelineError::Attempt("registry unavailable".to_string())),
        }
    }
}

/// Replies from a script, then repeats a fallback reply forever.
struct Scripted {
    publish: Mutex<VecDeque<Reply>>,
    publish_fallback: Reply,
    poll: Mutex<VecDeque<Reply>>,
    poll_fallback: Reply,
    publish_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl Scripted {
    fn new(
        publish: &[Reply],
        publish_fallback: Reply,
        poll: &[Reply],
        poll_fallback: Reply,
    ) -> Self {
        Self {
            publish: Mutex::new(publish.iter().copied().collect()),
            publish_fallback,
            poll: Mutex::new(poll.iter().copied().collect()),
            poll_fallback,
            publish_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    fn publishing(reply: Reply) -> Self {
        Self::new(&[], reply, &[], Reply::Processing)
    }

    fn polling(script: &[Reply], fallback: Reply) -> Self {
        Self::new(&[], Reply::Processing, script, fallback)
    }
}

#[async_trait]
impl PublicationService for Scripted {
    async fn attempt_publish(
        &self,
        request: &PublishRequest,
        _shutdown: &Shutdown,
    ) -> Result<PublicationOutcome, PipelineError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .publish
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.publish_fallback);
        reply.into_outcome(request.id.to_string())
    }

    async fn poll_status(
        &self,
        request: &StatusUpdateRequest,
        _shutdown: &Shutdown,
    ) -> Result<PublicationOutcome, PipelineError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .poll
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.poll_fallback);
        reply.into_outcome(request.ref_id.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    outcomes: Mutex<Vec<TerminalOutcome>>,
}

impl RecordingSink {
    fn outcomes(&self) -> Vec<TerminalOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutcomeSink for RecordingSink {
    async fn completed(&self, outcome: TerminalOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn request(i: i64) -> PublishRequest {
    PublishRequest {
        id: Uuid::new_v4(),
        document_id: i,
        document_revision: i + 155,
        document_type: DocumentType::One,
        organization_id: i,
        user_id: i,
        user_input_data: UserInputData::One(DocumentOneInput {
            login: "1".to_string(),
            password: "test".to_string(),
            registry_number: "4".to_string(),
        }),
    }
}

fn delivery_of<M: Serialize>(message: &M, delivery_count: u32) -> Delivery {
    Delivery {
        delivery_tag: 1,
        message_id: None,
        body: serde_json::to_vec(message).unwrap(),
        redelivered: delivery_count > 0,
        delivery_count: Some(delivery_count),
    }
}

fn status_binding(max_retry_count: u32) -> QueueBinding {
    let mut binding = QueueBinding::new(STATUS_QUEUE);
    binding.max_retry_count = max_retry_count;
    binding
}

struct Harness {
    transport: Arc<MemoryTransport>,
    service: Arc<Scripted>,
    sink: Arc<RecordingSink>,
    status_producer: Producer<MemoryTransport>,
}

impl Harness {
    fn new(service: Scripted, status: QueueBinding) -> Self {
        let transport = Arc::new(MemoryTransport::new());
        Self {
            status_producer: Producer::new(Arc::clone(&transport), Arc::new(status)),
            transport,
            service: Arc::new(service),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    fn publish_handler(&self, max_retry_count: u32) -> PublishHandler<MemoryTransport> {
        PublishHandler::new(
            self.service.clone(),
            self.status_producer.clone(),
            self.sink.clone(),
            max_retry_count,
        )
    }

    fn status_handler(&self) -> StatusHandler<MemoryTransport> {
        StatusHandler::new(self.service.clone(), self.status_producer.clone(), self.sink.clone())
    }

    fn status_updates(&self) -> Vec<StatusUpdateRequest> {
        self.transport.published_as(STATUS_QUEUE)
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Publish pipeline
// =============================================================================

#[tokio::test]
async fn test_succeeded_publish_acks_without_status_update() {
    let harness = Harness::new(Scripted::publishing(Reply::Succeeded(7)), status_binding(3));
    let (_trigger, shutdown) = shutdown::channel();
    let request = request(1);

    let disposition = harness
        .publish_handler(0)
        .handle(&delivery_of(&request, 0), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Ack);
    assert!(harness.status_updates().is_empty());
    assert_eq!(
        harness.sink.outcomes(),
        vec![TerminalOutcome {
            ref_id: request.id.to_string(),
            result: TerminalResult::Succeeded { load_id: 7 },
        }]
    );
}

#[tokio::test]
async fn test_failed_publish_is_terminal() {
    let harness = Harness::new(Scripted::publishing(Reply::Failed), status_binding(3));
    let (_trigger, shutdown) = shutdown::channel();

    let disposition = harness
        .publish_handler(0)
        .handle(&delivery_of(&request(2), 0), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Ack);
    assert!(harness.status_updates().is_empty());
    assert_eq!(
        harness.sink.outcomes()[0].result,
        TerminalResult::Failed {
            reason: FailureReason::Rejected
        }
    );
}

#[tokio::test]
async fn test_processing_publish_emits_one_status_update() {
    let harness = Harness::new(Scripted::publishing(Reply::Processing), status_binding(3));
    let (_trigger, shutdown) = shutdown::channel();
    let request = request(3);

    let disposition = harness
        .publish_handler(0)
        .handle(&delivery_of(&request, 0), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Ack);
    assert!(harness.sink.outcomes().is_empty());

    let updates = harness.status_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].ref_id, request.id.to_string());
    assert_eq!(updates[0].attempt_count, 0);
    assert_eq!(updates[0].user_id, request.user_id);
    assert_eq!(updates[0].user_data, request.user_input_data);
    assert_eq!(updates[0].revision_identity, request.revision_identity());
}

#[tokio::test]
async fn test_status_enqueue_failure_requeues_publish_request() {
    let harness = Harness::new(Scripted::publishing(Reply::Processing), status_binding(3));
    harness.transport.set_publish_failure(true);
    let (_trigger, shutdown) = shutdown::channel();

    let disposition = harness
        .publish_handler(0)
        .handle(&delivery_of(&request(4), 0), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Requeue);
    assert!(harness.sink.outcomes().is_empty());
}

#[tokio::test]
async fn test_redelivered_request_is_attempted_again_consistently() {
    let harness = Harness::new(Scripted::publishing(Reply::Succeeded(11)), status_binding(3));
    let (_trigger, shutdown) = shutdown::channel();
    let handler = harness.publish_handler(0);
    let request = request(5);

    assert_eq!(handler.handle(&delivery_of(&request, 0), &shutdown).await, Disposition::Ack);
    assert_eq!(handler.handle(&delivery_of(&request, 1), &shutdown).await, Disposition::Ack);

    let outcomes = harness.sink.outcomes();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.ref_id == request.id.to_string()));
    assert_eq!(harness.service.publish_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_poison_publish_request_is_dead_lettered() {
    let harness = Harness::new(Scripted::publishing(Reply::Error), status_binding(3));
    let (_trigger, shutdown) = shutdown::channel();
    let request = request(6);

    let disposition = harness
        .publish_handler(3)
        .handle(&delivery_of(&request, 4), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Reject);
    assert_eq!(harness.service.publish_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.sink.outcomes(),
        vec![TerminalOutcome::retry_exhausted(request.id.to_string())]
    );
}

#[tokio::test]
async fn test_shutdown_before_attempt_requeues() {
    let harness = Harness::new(Scripted::publishing(Reply::Succeeded(1)), status_binding(3));
    let (trigger, shutdown) = shutdown::channel();
    trigger.trigger();

    let disposition = harness
        .publish_handler(0)
        .handle(&delivery_of(&request(7), 0), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Requeue);
    assert_eq!(harness.service.publish_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_attempt_error_nacks_and_redelivery_reinvokes() {
    let harness = Harness::new(
        Scripted::new(&[Reply::Error], Reply::Succeeded(99), &[], Reply::Processing),
        status_binding(3),
    );
    let mut binding = QueueBinding::new(PUBLISH_QUEUE);
    binding.consumer_count = 1;
    let binding = Arc::new(binding);

    let request = request(8);
    Producer::new(Arc::clone(&harness.transport), Arc::clone(&binding))
        .publish(&request)
        .await
        .unwrap();

    let (trigger, shutdown) = shutdown::channel();
    let pool = tokio::spawn(pool::run(
        "publish",
        Arc::clone(&harness.transport),
        binding,
        Arc::new(harness.publish_handler(0)),
        shutdown,
    ));

    let transport = Arc::clone(&harness.transport);
    wait_until(|| transport.acked_count(PUBLISH_QUEUE) == 1).await;
    trigger.trigger();
    pool.await.unwrap().unwrap();

    assert_eq!(harness.service.publish_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        harness.sink.outcomes(),
        vec![TerminalOutcome {
            ref_id: request.id.to_string(),
            result: TerminalResult::Succeeded { load_id: 99 },
        }]
    );
    assert!(harness.transport.dead_letters(PUBLISH_QUEUE).is_empty());
}

#[tokio::test]
async fn test_malformed_message_is_dead_lettered_not_retried() {
    let harness = Harness::new(Scripted::publishing(Reply::Succeeded(1)), status_binding(3));
    let mut binding = QueueBinding::new(PUBLISH_QUEUE);
    binding.consumer_count = 2;

    harness
        .transport
        .push_raw(PUBLISH_QUEUE, "garbage", b"{\"id\": 42".to_vec());

    let (trigger, shutdown) = shutdown::channel();
    let pool = tokio::spawn(pool::run(
        "publish",
        Arc::clone(&harness.transport),
        Arc::new(binding),
        Arc::new(harness.publish_handler(0)),
        shutdown,
    ));

    let transport = Arc::clone(&harness.transport);
    wait_until(|| transport.dead_letters(PUBLISH_QUEUE).len() == 1).await;
    trigger.trigger();
    pool.await.unwrap().unwrap();

    assert_eq!(harness.service.publish_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.transport.ready_count(PUBLISH_QUEUE), 0);
    assert!(harness.sink.outcomes().is_empty());
}

// =============================================================================
// Concurrency
// =============================================================================

/// Blocks every attempt on a barrier sized to the consumer count, so the test
/// only finishes if all consumers hold a message at the same time.
struct Rendezvous {
    barrier: Barrier,
    seen: Mutex<HashMap<Uuid, usize>>,
}

#[async_trait]
impl PublicationService for Rendezvous {
    async fn attempt_publish(
        &self,
        request: &PublishRequest,
        _shutdown: &Shutdown,
    ) -> Result<PublicationOutcome, PipelineError> {
        *self.seen.lock().unwrap().entry(request.id).or_default() += 1;
        self.barrier.wait().await;
        Ok(PublicationOutcome::succeeded(
            request.id.to_string(),
            request.document_id,
        ))
    }

    async fn poll_status(
        &self,
        request: &StatusUpdateRequest,
        _shutdown: &Shutdown,
    ) -> Result<PublicationOutcome, PipelineError> {
        Ok(PublicationOutcome::failed(request.ref_id.clone()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consumers_process_distinct_messages_concurrently() {
    const CONSUMERS: usize = 4;

    let transport = Arc::new(MemoryTransport::new());
    let sink = Arc::new(RecordingSink::default());
    let service = Arc::new(Rendezvous {
        barrier: Barrier::new(CONSUMERS),
        seen: Mutex::new(HashMap::new()),
    });

    let mut binding = QueueBinding::new(PUBLISH_QUEUE);
    binding.consumer_count = CONSUMERS;
    let binding = Arc::new(binding);

    let producer = Producer::new(Arc::clone(&transport), Arc::clone(&binding));
    let requests: Vec<_> = (0..CONSUMERS as i64).map(request).collect();
    for request in &requests {
        producer.publish(request).await.unwrap();
    }

    let handler = PublishHandler::new(
        service.clone(),
        Producer::new(Arc::clone(&transport), Arc::new(status_binding(3))),
        sink.clone(),
        0,
    );

    let (trigger, shutdown) = shutdown::channel();
    let pool = tokio::spawn(pool::run(
        "publish",
        Arc::clone(&transport),
        binding,
        Arc::new(handler),
        shutdown,
    ));

    let acked = Arc::clone(&transport);
    wait_until(|| acked.acked_count(PUBLISH_QUEUE) == CONSUMERS).await;
    trigger.trigger();
    pool.await.unwrap().unwrap();

    let seen = service.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), CONSUMERS);
    assert!(seen.values().all(|&count| count == 1));

    // each outcome carries its own request's document id as load id
    let outcomes = sink.outcomes();
    assert_eq!(outcomes.len(), CONSUMERS);
    for request in &requests {
        let outcome = outcomes
            .iter()
            .find(|o| o.ref_id == request.id.to_string())
            .unwrap();
        assert_eq!(
            outcome.result,
            TerminalResult::Succeeded {
                load_id: request.document_id
            }
        );
    }
    assert_eq!(transport.unacked_count(PUBLISH_QUEUE), 0);
}

// =============================================================================
// Status-update pipeline
// =============================================================================

async fn run_status_pool(harness: &Harness, seed: &StatusUpdateRequest) {
    harness.status_producer.publish(seed).await.unwrap();

    let (trigger, shutdown) = shutdown::channel();
    let pool = tokio::spawn(pool::run(
        "status_update",
        Arc::clone(&harness.transport),
        Arc::new(harness.status_producer.binding().clone()),
        Arc::new(harness.status_handler()),
        shutdown,
    ));

    let sink = Arc::clone(&harness.sink);
    wait_until(|| !sink.outcomes().is_empty()).await;

    // let any stray republish surface before stopping
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.trigger();
    pool.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_status_polling_exhausts_retry_budget() {
    let harness = Harness::new(Scripted::polling(&[], Reply::Processing), status_binding(3));
    let seed = StatusUpdateRequest::from_publish(&request(10), "ref-exhaust");

    run_status_pool(&harness, &seed).await;

    assert_eq!(harness.service.poll_calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        harness.sink.outcomes(),
        vec![TerminalOutcome::retry_exhausted("ref-exhaust")]
    );

    let attempts: Vec<u32> = harness
        .status_updates()
        .iter()
        .map(|u| u.attempt_count)
        .collect();
    assert_eq!(attempts, vec![0, 1, 2, 3]);
    assert_eq!(harness.transport.acked_count(STATUS_QUEUE), 4);
    assert_eq!(harness.transport.ready_count(STATUS_QUEUE), 0);
}

#[tokio::test]
async fn test_status_polling_stops_on_success() {
    let harness = Harness::new(
        Scripted::polling(&[Reply::Processing, Reply::Succeeded(42)], Reply::Processing),
        status_binding(5),
    );
    let seed = StatusUpdateRequest::from_publish(&request(11), "ref-success");

    run_status_pool(&harness, &seed).await;

    assert_eq!(harness.service.poll_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        harness.sink.outcomes(),
        vec![TerminalOutcome {
            ref_id: "ref-success".to_string(),
            result: TerminalResult::Succeeded { load_id: 42 },
        }]
    );
    assert_eq!(harness.status_updates().len(), 2);
}

#[tokio::test]
async fn test_status_attempt_count_at_limit_is_exhausted_without_panic() {
    let harness = Harness::new(Scripted::polling(&[], Reply::Processing), status_binding(3));
    let mut seed = StatusUpdateRequest::from_publish(&request(16), "ref-overflow");
    seed.attempt_count = u32::MAX;

    run_status_pool(&harness, &seed).await;

    assert_eq!(harness.service.poll_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.sink.outcomes(),
        vec![TerminalOutcome::retry_exhausted("ref-overflow")]
    );
    assert_eq!(harness.status_updates().len(), 1);
    assert_eq!(harness.transport.acked_count(STATUS_QUEUE), 1);
    assert!(harness.transport.dead_letters(STATUS_QUEUE).is_empty());
}

#[tokio::test]
async fn test_poison_status_update_is_dead_lettered() {
    let harness = Harness::new(Scripted::polling(&[], Reply::Error), status_binding(5));
    let (_trigger, shutdown) = shutdown::channel();
    let seed = StatusUpdateRequest::from_publish(&request(17), "ref-poison");

    let disposition = harness
        .status_handler()
        .handle(&delivery_of(&seed, 6), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Reject);
    assert_eq!(harness.service.poll_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.sink.outcomes(),
        vec![TerminalOutcome::retry_exhausted("ref-poison")]
    );
    assert!(harness.status_updates().is_empty());
}

#[tokio::test]
async fn test_status_poll_failure_is_terminal() {
    let harness = Harness::new(
        Scripted::polling(&[Reply::Failed], Reply::Processing),
        status_binding(5),
    );
    let (_trigger, shutdown) = shutdown::channel();
    let seed = StatusUpdateRequest::from_publish(&request(12), "ref-failed");

    let disposition = harness
        .status_handler()
        .handle(&delivery_of(&seed, 0), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Ack);
    assert!(harness.status_updates().is_empty());
    assert_eq!(
        harness.sink.outcomes()[0].result,
        TerminalResult::Failed {
            reason: FailureReason::Rejected
        }
    );
}

#[tokio::test]
async fn test_status_poll_error_requeues() {
    let harness = Harness::new(
        Scripted::polling(&[Reply::Error], Reply::Processing),
        status_binding(5),
    );
    let (_trigger, shutdown) = shutdown::channel();
    let seed = StatusUpdateRequest::from_publish(&request(13), "ref-error");

    let disposition = harness
        .status_handler()
        .handle(&delivery_of(&seed, 0), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Requeue);
    assert!(harness.sink.outcomes().is_empty());
    assert!(harness.status_updates().is_empty());
}

#[tokio::test]
async fn test_status_republish_failure_requeues() {
    let harness = Harness::new(Scripted::polling(&[], Reply::Processing), status_binding(5));
    harness.transport.set_publish_failure(true);
    let (_trigger, shutdown) = shutdown::channel();
    let seed = StatusUpdateRequest::from_publish(&request(14), "ref-republish");

    let disposition = harness
        .status_handler()
        .handle(&delivery_of(&seed, 0), &shutdown)
        .await;

    assert_eq!(disposition, Disposition::Requeue);
    assert!(harness.sink.outcomes().is_empty());
}

#[tokio::test]
async fn test_malformed_status_update_is_rejected() {
    let harness = Harness::new(Scripted::polling(&[], Reply::Processing), status_binding(5));
    let (_trigger, shutdown) = shutdown::channel();
    let delivery = Delivery {
        delivery_tag: 9,
        message_id: None,
        body: b"not json".to_vec(),
        redelivered: false,
        delivery_count: None,
    };

    let disposition = harness.status_handler().handle(&delivery, &shutdown).await;

    assert_eq!(disposition, Disposition::Reject);
    assert_eq!(harness.service.poll_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_status_retry_respects_delay() {
    let mut binding = status_binding(5);
    binding.with_delay = true;
    binding.retry_delay_secs = 30;

    let harness = Harness::new(Scripted::polling(&[], Reply::Processing), binding);
    let (_trigger, shutdown) = shutdown::channel();
    let seed = StatusUpdateRequest::from_publish(&request(15), "ref-delay");

    let disposition = harness
        .status_handler()
        .handle(&delivery_of(&seed, 0), &shutdown)
        .await;
    assert_eq!(disposition, Disposition::Ack);

    let updates = harness.status_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].attempt_count, 1);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(harness.transport.ready_count(STATUS_QUEUE), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.transport.ready_count(STATUS_QUEUE), 1);
}
