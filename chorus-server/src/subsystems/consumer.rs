//! Queue consumer: pulls dispatch payloads off the work queue and runs the
//! hop loop once per message.
//!
//! A message is acked only after its dispatch finishes. While a chain runs,
//! its visibility timeout is renewed on a heartbeat so no other consumer picks
//! it up. Failures leave it to reappear after the visibility timeout; the
//! queue dead-letters it once the receive limit is hit. Bodies that do not
//! parse or fail payload validation are dead-lettered at once.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::config::QueueConfig;
use chorus_core::models::{DispatchPayload, RequestStatus};
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::dispatch::{DispatchError, DispatchReport, Dispatcher};
use crate::queue::{FailOutcome, QueueMessage, WorkQueue};
use crate::store::ConversationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Acked,
    Retrying,
    DeadLettered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub acked: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
}

pub struct Consumer {
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn ConversationStore>,
    dispatcher: Arc<Dispatcher>,
    config: QueueConfig,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn ConversationStore>,
        dispatcher: Arc<Dispatcher>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            store,
            dispatcher,
            config,
        }
    }

    /// Receive one batch and process its messages concurrently.
    pub async fn process_batch(&self) -> anyhow::Result<BatchReport> {
        let messages = self.queue.receive(self.config.batch_size).await?;
        let mut report = BatchReport {
            received: messages.len(),
            ..Default::default()
        };

        let outcomes: Vec<MessageOutcome> = stream::iter(messages)
            .map(|message| self.handle_message(message))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                MessageOutcome::Acked => report.acked += 1,
                MessageOutcome::Retrying => report.retrying += 1,
                MessageOutcome::DeadLettered => report.dead_lettered += 1,
            }
        }
        Ok(report)
    }

    pub async fn handle_message(&self, message: QueueMessage) -> MessageOutcome {
        let mut payload: DispatchPayload = match serde_json::from_value(message.body.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "Malformed queue body");
                self.dead_letter(message.id, &format!("malformed body: {}", e)).await;
                return MessageOutcome::DeadLettered;
            }
        };
        // Every unit of work starts a fresh chain.
        payload.recursion_depth = 0;

        match self.dispatch_with_heartbeat(message.id, &payload).await {
            Ok(report) => {
                tracing::info!(
                    message_id = %message.id,
                    session_id = %payload.session_id,
                    hops = report.hops.len(),
                    outcome = ?report.outcome,
                    "Dispatch complete"
                );
                if let Err(e) = self.queue.ack(message.id).await {
                    // Not acked means it will be redelivered; replays are tolerated.
                    tracing::error!(message_id = %message.id, error = %e, "Ack failed");
                }
                self.track(&payload, RequestStatus::Completed, None).await;
                MessageOutcome::Acked
            }
            Err(DispatchError::InvalidPayload(reason)) => {
                let error = format!("invalid payload: {}", reason);
                tracing::warn!(message_id = %message.id, error = %error, "Unprocessable queue body");
                self.dead_letter(message.id, &error).await;
                self.track(&payload, RequestStatus::Failed, Some(&error)).await;
                MessageOutcome::DeadLettered
            }
            Err(e) => {
                let error = e.to_string();
                match self.queue.fail(message.id, &error).await {
                    Ok(FailOutcome::Retry) => {
                        tracing::warn!(
                            message_id = %message.id,
                            receive_count = message.receive_count,
                            error = %error,
                            "Dispatch failed; message will be retried"
                        );
                        MessageOutcome::Retrying
                    }
                    Ok(FailOutcome::DeadLettered) => {
                        tracing::error!(
                            message_id = %message.id,
                            receive_count = message.receive_count,
                            error = %error,
                            "Dispatch failed; message dead-lettered"
                        );
                        self.track(&payload, RequestStatus::Failed, Some(&error)).await;
                        MessageOutcome::DeadLettered
                    }
                    Err(qe) => {
                        tracing::error!(message_id = %message.id, error = %qe, "Recording failure failed");
                        MessageOutcome::Retrying
                    }
                }
            }
        }
    }

    /// Run the hop loop, renewing the message's visibility until it returns.
    async fn dispatch_with_heartbeat(
        &self,
        id: Uuid,
        payload: &DispatchPayload,
    ) -> Result<DispatchReport, DispatchError> {
        let dispatch = self.dispatcher.dispatch(payload);
        tokio::pin!(dispatch);

        let mut heartbeat = tokio::time::interval(self.heartbeat_period());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires at once; receive just set the timeout.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut dispatch => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.queue.extend_visibility(id).await {
                        tracing::warn!(message_id = %id, error = %e, "Visibility extension failed");
                    }
                }
            }
        }
    }

    fn heartbeat_period(&self) -> Duration {
        let secs = (self.config.visibility_timeout_seconds / 3).max(1);
        Duration::from_secs(secs as u64)
    }

    async fn dead_letter(&self, id: Uuid, error: &str) {
        if let Err(e) = self.queue.dead_letter(id, error).await {
            tracing::error!(message_id = %id, error = %e, "Dead-letter failed");
        }
    }

    async fn track(&self, payload: &DispatchPayload, status: RequestStatus, error: Option<&str>) {
        let Some(request_id) = payload.request_id else {
            return;
        };
        if let Err(e) = self
            .store
            .update_request_status(request_id, status, error)
            .await
        {
            tracing::warn!(request_id = %request_id, error = %e, "Request status update failed");
        }
    }
}

/// Poll the queue until shutdown fires.
pub async fn run_consumer(consumer: Arc<Consumer>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(consumer.config.poll_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        poll_interval_ms = consumer.config.poll_interval_ms,
        batch_size = consumer.config.batch_size,
        concurrency = consumer.config.concurrency,
        "Queue consumer started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match consumer.process_batch().await {
                    Ok(report) if report.received > 0 => {
                        tracing::debug!(
                            received = report.received,
                            acked = report.acked,
                            retrying = report.retrying,
                            dead_lettered = report.dead_lettered,
                            "Batch processed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Queue receive failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Queue consumer shutting down");
                break;
            }
        }
    }
}
