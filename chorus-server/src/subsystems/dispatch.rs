//! Hop loop: persist the inbound message, route it to an agent, deliver the
//! output to the chosen agent's live connection, persist the output, and in
//! RECURSIVE mode feed the output back in as the next inbound message until
//! the depth bound is reached.
//!
//! With `addressee_override` on, an output opening with "Hey <Name>," names
//! the delivery target and the next hop's addressee instead of the chosen
//! agent.
//!
//! A chain of hops `h_0..h_k` always satisfies `k <= max_recursion - start`.
//! Each hop writes exactly two message records. Earlier hops stay persisted
//! when a later hop fails.

use std::sync::Arc;

use chorus_core::config::DispatchConfig;
use chorus_core::llm::{AgentRouter, LlmError, RouteOutput, RouteRequest};
use chorus_core::models::{ChatMessage, ChatMode, DispatchPayload};
use chorus_core::protocol::ServerFrame;
use chorus_core::AgentRegistry;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use thiserror::Error;

use crate::delivery::{Delivery, DeliveryError};
use crate::store::{ConversationStore, StoreError};

/// Streamed output is buffered until this many characters have arrived or a
/// comma settles whether it opens with a "Hey <Name>," greeting.
const GREETING_LOOKAHEAD: usize = 64;

// ============================================================================
// PUBLIC API
// ============================================================================

#[derive(Error, Debug)]
pub enum HopError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("routing: {0}")]
    Llm(#[from] LlmError),

    #[error("delivery: {0}")]
    Delivery(#[from] DeliveryError),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Hop {hop} failed (agent: {}): {source}", .agent.as_deref().unwrap_or("none"))]
    Hop {
        hop: u32,
        agent: Option<String>,
        #[source]
        source: HopError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// STANDARD mode finished its single hop.
    Done,
    /// RECURSIVE chain stopped at the depth bound.
    LimitReached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HopRecord {
    pub depth: u32,
    /// Author of the inbound message for this hop.
    pub author: String,
    /// Agent that produced the output.
    pub agent: String,
    /// Character the output was delivered to and persisted under: the chosen
    /// agent, or the agent named by a "Hey <Name>," greeting.
    pub addressee: String,
    /// Whether a live connection received the output.
    pub delivered: bool,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub hops: Vec<HopRecord>,
    pub outcome: DispatchOutcome,
}

pub struct Dispatcher {
    store: Arc<dyn ConversationStore>,
    router: Arc<dyn AgentRouter>,
    delivery: Arc<dyn Delivery>,
    registry: Arc<AgentRegistry>,
    config: DispatchConfig,
}

/// Loop accumulator carried from one hop to the next.
#[derive(Debug, Clone)]
struct HopInput {
    author: String,
    addressee: String,
    depth: u32,
    text: String,
}

/// Hands out write timestamps for one chain. Every stamp lands in a later
/// millisecond than the one before, so sort keys follow write order.
#[derive(Debug, Default)]
struct MessageClock {
    last: Option<DateTime<Utc>>,
}

impl MessageClock {
    fn next(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last {
            Some(last) if now.timestamp_millis() <= last.timestamp_millis() => {
                last + Duration::milliseconds(1)
            }
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

/// Failure inside a hop, with the character whose channel should hear about it.
struct HopFailure {
    agent: Option<String>,
    notify: Option<String>,
    error: HopError,
}

impl HopFailure {
    fn before_routing(error: impl Into<HopError>) -> Self {
        Self {
            agent: None,
            notify: None,
            error: error.into(),
        }
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        router: Arc<dyn AgentRouter>,
        delivery: Arc<dyn Delivery>,
        registry: Arc<AgentRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            router,
            delivery,
            registry,
            config,
        }
    }

    /// Run the hop loop for one payload until it terminates or a hop fails.
    pub async fn dispatch(&self, payload: &DispatchPayload) -> Result<DispatchReport, DispatchError> {
        payload.validate().map_err(DispatchError::InvalidPayload)?;

        let mut input = HopInput {
            author: payload.created_by.clone(),
            addressee: payload.character_id.clone(),
            depth: payload.recursion_depth,
            text: payload.data.clone(),
        };
        let mut hops = Vec::new();
        let mut clock = MessageClock::default();

        loop {
            let record = match self.run_hop(payload, &input, &mut clock).await {
                Ok(record) => record,
                Err(failure) => {
                    tracing::error!(
                        session_id = %payload.session_id,
                        hop = input.depth,
                        agent = failure.agent.as_deref().unwrap_or("none"),
                        error = %failure.error,
                        "Dispatch hop failed"
                    );
                    if let Some(character) = failure.notify.as_deref() {
                        self.notify_failure(&payload.session_id, character, &failure.error)
                            .await;
                    }
                    return Err(DispatchError::Hop {
                        hop: input.depth,
                        agent: failure.agent,
                        source: failure.error,
                    });
                }
            };

            tracing::info!(
                session_id = %payload.session_id,
                hop = record.depth,
                agent = %record.agent,
                addressee = %record.addressee,
                delivered = record.delivered,
                "Hop complete"
            );

            let next = HopInput {
                author: record.agent.clone(),
                addressee: record.addressee.clone(),
                depth: input.depth + 1,
                text: record.output.clone(),
            };
            hops.push(record);

            if input.depth >= self.config.max_recursion {
                return Ok(DispatchReport {
                    hops,
                    outcome: DispatchOutcome::LimitReached,
                });
            }
            if payload.chat_mode == ChatMode::Standard {
                return Ok(DispatchReport {
                    hops,
                    outcome: DispatchOutcome::Done,
                });
            }
            input = next;
        }
    }

    // ========================================================================
    // Hop
    // ========================================================================

    async fn run_hop(
        &self,
        payload: &DispatchPayload,
        input: &HopInput,
        clock: &mut MessageClock,
    ) -> Result<HopRecord, HopFailure> {
        let session_id = payload.session_id.as_str();
        let ttl_days = self.config.message_ttl_days;

        let inbound = ChatMessage::new(
            session_id,
            &input.author,
            &input.addressee,
            &input.text,
            clock.next(),
            ttl_days,
        );
        self.store
            .put_message(&inbound)
            .await
            .map_err(HopFailure::before_routing)?;

        let wallets = self
            .agent_wallets(&payload.created_by)
            .await
            .map_err(HopFailure::before_routing)?;
        let prompt = build_prompt(payload, &input.author, &input.addressee, &input.text, &wallets);

        let history = self
            .history(session_id, &inbound.sk)
            .await
            .map_err(HopFailure::before_routing)?;

        let outcome = self
            .router
            .route(
                &self.registry,
                RouteRequest {
                    session_id,
                    user_id: &payload.created_by,
                    author: &input.author,
                    addressee: &input.addressee,
                    prompt: &prompt,
                    history: &history,
                    sampling: payload.sampling(),
                },
            )
            .await
            .map_err(HopFailure::before_routing)?;

        let agent = outcome.agent;
        let fail_as = |target: &str, error: HopError| HopFailure {
            agent: Some(agent.clone()),
            notify: Some(target.to_string()),
            error,
        };

        let (addressee, delivered, output) = match outcome.output {
            RouteOutput::Text(text) => {
                let target = self.resolve_addressee(&text, &agent);
                let outbound =
                    ChatMessage::new(session_id, &agent, &target, &text, clock.next(), ttl_days);
                self.store
                    .put_message(&outbound)
                    .await
                    .map_err(|e| fail_as(&target, e.into()))?;

                let frame = ServerFrame::Message {
                    character_id: target.clone(),
                    data: text.clone(),
                };
                let delivered = self
                    .deliver(session_id, &target, &frame)
                    .await
                    .map_err(|e| fail_as(&target, e))?;
                (target, delivered, text)
            }
            RouteOutput::Stream(mut stream) => {
                let mut head = String::new();
                let mut ended = false;
                while !ended && !self.greeting_settled(&head) {
                    match stream.next().await {
                        Some(chunk) => head.push_str(
                            &chunk.map_err(|e| fail_as(&agent, e.into()))?,
                        ),
                        None => ended = true,
                    }
                }

                let target = self.resolve_addressee(&head, &agent);
                let mut connection = self
                    .store
                    .get_connection(session_id, &target)
                    .await
                    .map_err(|e| fail_as(&target, e.into()))?;
                let delivered = connection.is_some();

                let mut text = String::new();
                let mut pending = Some(head);
                loop {
                    let chunk = match pending.take() {
                        Some(head) => head,
                        None => match stream.next().await {
                            Some(chunk) => chunk.map_err(|e| fail_as(&target, e.into()))?,
                            None => break,
                        },
                    };
                    if chunk.is_empty() {
                        continue;
                    }
                    if let Some(connection_id) = connection.as_deref() {
                        let frame = ServerFrame::Chunk {
                            character_id: target.clone(),
                            data: chunk.clone(),
                        };
                        match self.delivery.post_to_connection(connection_id, &frame).await {
                            Ok(()) => {}
                            Err(DeliveryError::Gone(id)) => {
                                tracing::warn!(
                                    session_id,
                                    connection_id = %id,
                                    "Connection went away mid-stream"
                                );
                                connection = None;
                            }
                            Err(e) => return Err(fail_as(&target, e.into())),
                        }
                    }
                    text.push_str(&chunk);
                }

                let outbound =
                    ChatMessage::new(session_id, &agent, &target, &text, clock.next(), ttl_days);
                self.store
                    .put_message(&outbound)
                    .await
                    .map_err(|e| fail_as(&target, e.into()))?;
                (target, delivered, text)
            }
        };

        Ok(HopRecord {
            depth: input.depth,
            author: input.author.clone(),
            agent,
            addressee,
            delivered,
            output,
        })
    }

    /// Wallet address of every registered agent for `user_id`, one lookup at a time.
    async fn agent_wallets(&self, user_id: &str) -> Result<Vec<(String, Option<String>)>, StoreError> {
        let mut wallets = Vec::with_capacity(self.registry.agents().len());
        for agent in self.registry.agents() {
            let address = self.store.get_wallet(user_id, &agent.name).await?;
            wallets.push((agent.name.clone(), address));
        }
        Ok(wallets)
    }

    /// Recent session history, excluding the message this hop just wrote.
    async fn history(&self, session_id: &str, inbound_sk: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let limit = self.config.history_limit;
        let mut history = self.store.recent_messages(session_id, limit + 1).await?;
        history.retain(|m| m.sk != inbound_sk);
        let excess = history.len().saturating_sub(limit as usize);
        history.drain(..excess);
        Ok(history)
    }

    /// Delivery target for `output`: the agent a "Hey <Name>," greeting names
    /// when the override is on, otherwise the agent that produced it.
    fn resolve_addressee(&self, output: &str, chosen: &str) -> String {
        if self.config.addressee_override {
            if let Some(named) = self.registry.addressed_in(output) {
                return named.name.clone();
            }
        }
        chosen.to_string()
    }

    /// True once enough of a streamed output has arrived to tell whether it
    /// opens with a "Hey <Name>," greeting.
    fn greeting_settled(&self, head: &str) -> bool {
        if !self.config.addressee_override {
            return true;
        }
        let head = head.trim_start();
        if head.contains(',') || head.len() >= GREETING_LOOKAHEAD {
            return true;
        }
        head.len() >= 4 && !head.starts_with("Hey ")
    }

    /// Push a frame to the live connection for (session, character), if any.
    /// A stale connection counts as absent.
    async fn deliver(
        &self,
        session_id: &str,
        character_id: &str,
        frame: &ServerFrame,
    ) -> Result<bool, HopError> {
        let Some(connection_id) = self.store.get_connection(session_id, character_id).await? else {
            tracing::debug!(session_id, character_id, "No live connection; delivery skipped");
            return Ok(false);
        };
        match self.delivery.post_to_connection(&connection_id, frame).await {
            Ok(()) => Ok(true),
            Err(DeliveryError::Gone(id)) => {
                tracing::warn!(session_id, connection_id = %id, "Connection gone; delivery skipped");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn notify_failure(&self, session_id: &str, character_id: &str, error: &HopError) {
        let frame = ServerFrame::Error {
            character_id: Some(character_id.to_string()),
            message: format!("{} could not finish replying: {}", character_id, error),
        };
        if let Err(e) = self.deliver(session_id, character_id, &frame).await {
            tracing::warn!(session_id, character_id, error = %e, "Failure notice not delivered");
        }
    }
}

// ============================================================================
// Prompt
// ============================================================================

/// Context-augmented prompt handed to the router for one hop.
pub fn build_prompt(
    payload: &DispatchPayload,
    author: &str,
    addressee: &str,
    text: &str,
    wallets: &[(String, Option<String>)],
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("Sender: {}\n", author));
    prompt.push_str(&format!("Addressed to: {}\n", addressee));
    if let Some(address) = payload.senders_wallet_address.as_deref() {
        prompt.push_str(&format!("Sender wallet: {}\n", address));
    }
    if let Some(token) = payload.token_address.as_deref() {
        prompt.push_str(&format!("Token address: {}\n", token));
    }
    if let Some(chain) = payload.chain_id {
        prompt.push_str(&format!("Chain id: {}\n", chain));
    }

    let known: Vec<String> = wallets
        .iter()
        .filter_map(|(agent, address)| address.as_ref().map(|a| format!("{}: {}", agent, a)))
        .collect();
    if !known.is_empty() {
        prompt.push_str("Agent wallets:\n");
        for line in known {
            prompt.push_str(&format!("- {}\n", line));
        }
    }

    prompt.push_str("\nMessage:\n");
    prompt.push_str(text);
    prompt
}
