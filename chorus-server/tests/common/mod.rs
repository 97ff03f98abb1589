//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chorus_core::config::DispatchConfig;
use chorus_core::llm::{AgentRouter, LlmError, RouteOutcome, RouteOutput, RouteRequest};
use chorus_core::models::Connection;
use chorus_core::protocol::ServerFrame;
use chorus_core::AgentRegistry;
use chorus_server::delivery::{Delivery, DeliveryError};
use chorus_server::store::{ConversationStore, MemoryStore};
use chorus_server::subsystems::dispatch::Dispatcher;
use futures::stream::{self, StreamExt};

/// One scripted router reply.
pub enum Reply {
    Text(&'static str, &'static str),
    Stream(&'static str, Vec<&'static str>),
    Fail(&'static str),
    /// Text reply that takes this many seconds to arrive.
    Slow(&'static str, &'static str, u64),
}

/// What the router was asked on one call.
#[derive(Debug, Clone)]
pub struct SeenRoute {
    pub author: String,
    pub addressee: String,
    pub prompt: String,
    pub history: Vec<String>,
}

/// Router that plays back scripted replies in order. Once the script runs
/// out it answers as the addressed character with "ok".
#[derive(Default)]
pub struct ScriptedRouter {
    script: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<SeenRoute>>,
}

impl ScriptedRouter {
    pub fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<SeenRoute> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRouter for ScriptedRouter {
    async fn route(
        &self,
        _registry: &AgentRegistry,
        request: RouteRequest<'_>,
    ) -> Result<RouteOutcome, LlmError> {
        self.seen.lock().unwrap().push(SeenRoute {
            author: request.author.to_string(),
            addressee: request.addressee.to_string(),
            prompt: request.prompt.to_string(),
            history: request.history.iter().map(|m| m.message.clone()).collect(),
        });

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Reply::Text(agent, text)) => Ok(RouteOutcome::text(agent, text)),
            Some(Reply::Stream(agent, chunks)) => {
                let chunks: Vec<Result<String, LlmError>> =
                    chunks.into_iter().map(|c| Ok(c.to_string())).collect();
                Ok(RouteOutcome {
                    agent: agent.to_string(),
                    output: RouteOutput::Stream(stream::iter(chunks).boxed()),
                })
            }
            Some(Reply::Fail(message)) => Err(LlmError::InvalidResponse(message.to_string())),
            Some(Reply::Slow(agent, text, secs)) => {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                Ok(RouteOutcome::text(agent, text))
            }
            None => Ok(RouteOutcome::text(request.addressee, "ok")),
        }
    }
}

/// Delivery that records every frame it is asked to push.
#[derive(Default)]
pub struct RecordingDelivery {
    frames: Mutex<Vec<(String, ServerFrame)>>,
    /// Complete messages fail with a non-recoverable error.
    pub fail_messages: bool,
    /// Every push reports the connection as gone.
    pub gone: bool,
}

impl RecordingDelivery {
    pub fn failing_messages() -> Self {
        Self {
            fail_messages: true,
            ..Default::default()
        }
    }

    pub fn gone() -> Self {
        Self {
            gone: true,
            ..Default::default()
        }
    }

    pub fn frames(&self) -> Vec<(String, ServerFrame)> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn post_to_connection(
        &self,
        connection_id: &str,
        frame: &ServerFrame,
    ) -> Result<(), DeliveryError> {
        self.frames
            .lock()
            .unwrap()
            .push((connection_id.to_string(), frame.clone()));
        if self.gone {
            return Err(DeliveryError::Gone(connection_id.to_string()));
        }
        if self.fail_messages && matches!(frame, ServerFrame::Message { .. }) {
            return Err(DeliveryError::Failed("socket write failed".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub router: Arc<ScriptedRouter>,
    pub delivery: Arc<RecordingDelivery>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn harness(script: Vec<Reply>) -> Harness {
    harness_with(script, RecordingDelivery::default(), DispatchConfig::default())
}

pub fn harness_with(script: Vec<Reply>, delivery: RecordingDelivery, config: DispatchConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let router = Arc::new(ScriptedRouter::new(script));
    let delivery = Arc::new(delivery);
    let registry = Arc::new(AgentRegistry::standard("agent-model", "classifier-model"));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        router.clone(),
        delivery.clone(),
        registry,
        config,
    ));
    Harness {
        store,
        router,
        delivery,
        dispatcher,
    }
}

/// Record a live connection for (session, character).
pub async fn connect(store: &MemoryStore, session_id: &str, character_id: &str, connection_id: &str) {
    let ttl = chrono::Utc::now().timestamp() + 3600;
    store
        .put_connection(&Connection::new(session_id, character_id, connection_id, ttl))
        .await
        .unwrap();
}
