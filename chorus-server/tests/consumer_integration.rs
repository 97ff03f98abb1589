//! Queue consumer: ack on success, one retry, then dead-letter.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use chorus_core::config::{DispatchConfig, QueueConfig};
use chorus_core::models::{AgentRequest, ChatMode, DispatchPayload, RequestStatus};
use chorus_server::queue::{FailOutcome, MemoryQueue, QueueError, QueueMessage, WorkQueue};
use chorus_server::store::ConversationStore;
use chorus_server::subsystems::consumer::{Consumer, MessageOutcome};
use serde_json::json;
use uuid::Uuid;

use common::{harness_with, Harness, RecordingDelivery, Reply};

fn consumer(script: Vec<Reply>) -> (Consumer, Arc<MemoryQueue>, Harness) {
    let h = harness_with(script, RecordingDelivery::default(), DispatchConfig::default());
    let queue = Arc::new(MemoryQueue::new(300, 2));
    let consumer = Consumer::new(
        queue.clone(),
        h.store.clone(),
        h.dispatcher.clone(),
        QueueConfig::default(),
    );
    (consumer, queue, h)
}

fn body(mode: ChatMode, request_id: Option<Uuid>) -> serde_json::Value {
    let mut p = DispatchPayload::new("sess-q", "alice", "Nova", mode, "post something");
    p.request_id = request_id;
    serde_json::to_value(p).unwrap()
}

#[tokio::test]
async fn test_success_acks_and_completes_request() {
    let (consumer, queue, h) = consumer(vec![Reply::Text("Nova", "posted")]);
    let request_id = Uuid::new_v4();
    h.store
        .create_request(&AgentRequest::queued(request_id, "sess-q", "alice", "post something"))
        .await
        .unwrap();
    queue.enqueue(body(ChatMode::Standard, Some(request_id))).await.unwrap();

    let report = consumer.process_batch().await.unwrap();
    assert_eq!(report.received, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(queue.depth().await.unwrap(), 0);

    let record = h.store.get_request(request_id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Completed);
}

#[tokio::test]
async fn test_failure_retries_once_then_dead_letters() {
    let (consumer, queue, h) = consumer(vec![Reply::Fail("down"), Reply::Fail("still down")]);
    let request_id = Uuid::new_v4();
    h.store
        .create_request(&AgentRequest::queued(request_id, "sess-q", "alice", "post something"))
        .await
        .unwrap();
    queue.enqueue(body(ChatMode::Standard, Some(request_id))).await.unwrap();

    let first = consumer.process_batch().await.unwrap();
    assert_eq!(first.retrying, 1);
    assert_eq!(
        h.store.get_request(request_id).await.unwrap().unwrap().status,
        RequestStatus::Queued
    );

    // Still hidden by the visibility timeout
    assert_eq!(consumer.process_batch().await.unwrap().received, 0);

    queue.expire_visibility().await;
    let second = consumer.process_batch().await.unwrap();
    assert_eq!(second.dead_lettered, 1);
    assert_eq!(queue.depth().await.unwrap(), 0);
    assert_eq!(queue.dead_letters().await.len(), 1);

    let record = h.store.get_request(request_id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Failed);
    assert!(record.error.is_some());
}

#[tokio::test]
async fn test_malformed_body_is_dead_lettered_without_dispatch() {
    let (consumer, queue, h) = consumer(vec![]);
    queue.enqueue(json!({"sessionId": 42})).await.unwrap();

    let report = consumer.process_batch().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert!(h.router.seen().is_empty());
    let dead = queue.dead_letters().await;
    assert!(dead[0].1.as_deref().unwrap_or("").contains("malformed"));
}

#[tokio::test]
async fn test_unprocessable_payload_is_dead_lettered_without_retry() {
    let (consumer, queue, h) = consumer(vec![]);
    let request_id = Uuid::new_v4();
    h.store
        .create_request(&AgentRequest::queued(request_id, "sess-q", "alice", "   "))
        .await
        .unwrap();
    let mut p = DispatchPayload::new("sess-q", "alice", "Nova", ChatMode::Standard, "   ");
    p.request_id = Some(request_id);
    queue.enqueue(serde_json::to_value(p).unwrap()).await.unwrap();

    let report = consumer.process_batch().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.retrying, 0);
    assert_eq!(queue.depth().await.unwrap(), 0);
    assert_eq!(queue.dead_letter_count().await.unwrap(), 1);
    assert!(h.router.seen().is_empty());

    let record = h.store.get_request(request_id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Failed);
}

/// Work queue that counts visibility extensions.
struct CountingQueue {
    inner: MemoryQueue,
    extensions: AtomicUsize,
}

#[async_trait]
impl WorkQueue for CountingQueue {
    async fn enqueue(&self, body: serde_json::Value) -> Result<Uuid, QueueError> {
        self.inner.enqueue(body).await
    }
    async fn receive(&self, max: u32) -> Result<Vec<QueueMessage>, QueueError> {
        self.inner.receive(max).await
    }
    async fn ack(&self, id: Uuid) -> Result<(), QueueError> {
        self.inner.ack(id).await
    }
    async fn extend_visibility(&self, id: Uuid) -> Result<(), QueueError> {
        self.extensions.fetch_add(1, Ordering::SeqCst);
        self.inner.extend_visibility(id).await
    }
    async fn fail(&self, id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        self.inner.fail(id, error).await
    }
    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        self.inner.dead_letter(id, error).await
    }
    async fn depth(&self) -> Result<i64, QueueError> {
        self.inner.depth().await
    }
    async fn dead_letter_count(&self) -> Result<i64, QueueError> {
        self.inner.dead_letter_count().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_long_dispatch_keeps_renewing_visibility() {
    let h = harness_with(
        vec![Reply::Slow("Nova", "posted eventually", 10)],
        RecordingDelivery::default(),
        DispatchConfig::default(),
    );
    let queue = Arc::new(CountingQueue {
        inner: MemoryQueue::new(3, 2),
        extensions: AtomicUsize::new(0),
    });
    let config = QueueConfig {
        visibility_timeout_seconds: 3,
        ..QueueConfig::default()
    };
    let consumer = Consumer::new(queue.clone(), h.store.clone(), h.dispatcher.clone(), config);
    queue.enqueue(body(ChatMode::Standard, None)).await.unwrap();

    let report = consumer.process_batch().await.unwrap();
    assert_eq!(report.acked, 1);
    // 1s heartbeat over a 10s dispatch
    assert!(queue.extensions.load(Ordering::SeqCst) >= 9);
    assert_eq!(queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_queue_depth_field_is_ignored_and_chain_starts_at_zero() {
    let (consumer, queue, h) = consumer(vec![]);
    let mut b = body(ChatMode::Recursive, None);
    b["recursionDepth"] = json!(10);
    queue.enqueue(b).await.unwrap();

    let msg = queue.receive(1).await.unwrap().remove(0);
    let outcome = consumer.handle_message(msg).await;
    assert_eq!(outcome, MessageOutcome::Acked);
    // Started from 0, so the full chain of 11 hops ran
    assert_eq!(h.router.seen().len(), 11);
}
