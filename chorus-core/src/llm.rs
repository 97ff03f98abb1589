//! Agent routing over an OpenAI-compatible chat-completions API.
//!
//! A route is two calls: the classifier picks which agent answers, then that
//! agent generates the reply. Tool calls made by the agent are decoded into
//! `ToolCall`s, executed, and fed back for a bounded number of rounds.
//! Streaming agents return a lazy stream of text chunks parsed from SSE.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::agents::{AgentDescriptor, AgentRegistry};
use crate::config::LlmConfig;
use crate::models::payload::SamplingParams;
use crate::models::ChatMessage;
use crate::tools::{ToolCall, ToolExecutor};

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} retry attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

/// Agent output: one final text, or chunks produced as the model generates them.
pub enum RouteOutput {
    Text(String),
    Stream(BoxStream<'static, Result<String, LlmError>>),
}

impl std::fmt::Debug for RouteOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteOutput::Text(t) => f.debug_tuple("Text").field(t).finish(),
            RouteOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct RouteOutcome {
    /// Name of the agent that produced the output.
    pub agent: String,
    pub output: RouteOutput,
}

impl RouteOutcome {
    pub fn text(agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            output: RouteOutput::Text(text.into()),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.output, RouteOutput::Stream(_))
    }
}

/// Everything a router needs for one hop.
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    /// Author of the inbound message (the user, or an agent on recursive hops).
    pub author: &'a str,
    /// Character the inbound message is addressed to.
    pub addressee: &'a str,
    /// Context-augmented prompt.
    pub prompt: &'a str,
    /// Prior session messages, oldest first.
    pub history: &'a [ChatMessage],
    pub sampling: SamplingParams,
}

/// Picks the responding agent and produces its output.
#[async_trait]
pub trait AgentRouter: Send + Sync {
    async fn route(
        &self,
        registry: &AgentRegistry,
        request: RouteRequest<'_>,
    ) -> Result<RouteOutcome, LlmError>;
}

// ============================================================================
// Wire types (private)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool_result(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// LlmRouter
// ============================================================================

pub struct LlmRouter {
    client: Client,
    base_url: String,
    api_key: String,
    max_retries: usize,
    retry_delay_ms: u64,
    max_tool_rounds: usize,
    tools: Arc<dyn ToolExecutor>,
}

impl LlmRouter {
    pub fn new(config: &LlmConfig, tools: Arc<dyn ToolExecutor>) -> Result<Self, LlmError> {
        Self::with_api_key(config, config.api_key(), tools)
    }

    pub fn with_api_key(
        config: &LlmConfig,
        api_key: String,
        tools: Arc<dyn ToolExecutor>,
    ) -> Result<Self, LlmError> {
        if api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            max_tool_rounds: config.max_tool_rounds,
            tools,
        })
    }

    /// Ask the classifier which agent should answer. Falls back to the
    /// addressed character, then to the registry default.
    pub async fn classify<'r>(
        &self,
        registry: &'r AgentRegistry,
        request: &RouteRequest<'_>,
    ) -> Result<&'r AgentDescriptor, LlmError> {
        let classifier = registry.classifier();
        let roster: Vec<String> = registry
            .agents()
            .iter()
            .map(|a| format!("- {}: {}", a.name, a.description))
            .collect();

        let recent: Vec<String> = request
            .history
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|m| format!("{}: {}", m.created_by, m.message))
            .collect();

        let messages = vec![
            WireMessage::new(
                "system",
                format!("{}\n\nAgents:\n{}", classifier.system_prompt, roster.join("\n")),
            ),
            WireMessage::new(
                "user",
                format!(
                    "Recent conversation:\n{}\n\nLatest message from {} addressed to {}:\n{}",
                    recent.join("\n"),
                    request.author,
                    request.addressee,
                    request.prompt
                ),
            ),
        ];

        let body = CompletionRequest {
            model: &classifier.model,
            messages: &messages,
            temperature: Some(0.0),
            max_tokens: Some(16),
            top_p: None,
            tools: Vec::new(),
            stream: false,
        };

        let reply = self.complete(&body).await?;
        let answer = reply.content.unwrap_or_default();
        let chosen = resolve_agent(registry, &answer, request.addressee);

        tracing::debug!(
            session_id = request.session_id,
            classifier_reply = %answer.trim(),
            agent = %chosen.name,
            "Classified message"
        );
        Ok(chosen)
    }

    /// Generate `agent`'s reply, running tool rounds for non-streaming agents.
    pub async fn generate(
        &self,
        agent: &AgentDescriptor,
        request: &RouteRequest<'_>,
    ) -> Result<RouteOutput, LlmError> {
        let mut messages = vec![WireMessage::new("system", agent.system_prompt.clone())];
        for m in request.history {
            if m.created_by == agent.name {
                messages.push(WireMessage::new("assistant", m.message.clone()));
            } else {
                messages.push(WireMessage::new(
                    "user",
                    format!("{}: {}", m.created_by, m.message),
                ));
            }
        }
        messages.push(WireMessage::new("user", request.prompt));

        if agent.streaming {
            let body = CompletionRequest {
                model: &agent.model,
                messages: &messages,
                temperature: request.sampling.temperature,
                max_tokens: request.sampling.max_tokens,
                top_p: request.sampling.top_p,
                tools: Vec::new(),
                stream: true,
            };
            let response = self.with_retry(|| self.post_once(&body)).await?;
            return Ok(RouteOutput::Stream(sse_text_stream(response)));
        }

        let tool_defs: Vec<serde_json::Value> = agent
            .tools
            .iter()
            .map(|kind| {
                json!({
                    "type": "function",
                    "function": {
                        "name": kind.as_str(),
                        "description": kind.description(),
                        "parameters": kind.parameters(),
                    }
                })
            })
            .collect();

        let mut round = 0;
        loop {
            let offer_tools = round < self.max_tool_rounds;
            let body = CompletionRequest {
                model: &agent.model,
                messages: &messages,
                temperature: request.sampling.temperature,
                max_tokens: request.sampling.max_tokens,
                top_p: request.sampling.top_p,
                tools: if offer_tools { tool_defs.clone() } else { Vec::new() },
                stream: false,
            };
            let reply = self.complete(&body).await?;

            let calls = reply.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() || !offer_tools {
                return Ok(RouteOutput::Text(reply.content.unwrap_or_default()));
            }

            messages.push(reply);
            for call in &calls {
                let result = self.run_tool(agent, call).await;
                messages.push(WireMessage::tool_result(&call.id, result));
            }
            round += 1;
        }
    }

    /// Execute one model tool call. Failures become the tool result text so
    /// the model can react to them.
    async fn run_tool(&self, agent: &AgentDescriptor, call: &WireToolCall) -> String {
        let decoded = match ToolCall::decode(&call.function.name, &call.function.arguments) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(agent = %agent.name, error = %e, "Rejected tool call");
                return format!("error: {}", e);
            }
        };

        if !agent.can_use(decoded.kind()) {
            tracing::warn!(agent = %agent.name, tool = decoded.kind().as_str(), "Tool not permitted");
            return format!(
                "error: agent {} is not allowed to use {}",
                agent.name,
                decoded.kind().as_str()
            );
        }

        match self.tools.execute(&decoded).await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(agent = %agent.name, tool = decoded.kind().as_str(), error = %e, "Tool call failed");
                format!("error: {}", e)
            }
        }
    }

    async fn complete(&self, body: &CompletionRequest<'_>) -> Result<WireMessage, LlmError> {
        let response = self.with_retry(|| self.post_once(body)).await?;
        let parsed: CompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::InvalidResponse("no choices in completion".to_string()))
    }

    async fn with_retry<F, Fut>(&self, action: F) -> Result<reqwest::Response, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, LlmError>>,
    {
        let retry_strategy = ExponentialBackoff::from_millis(self.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        Retry::spawn(retry_strategy, action).await.map_err(|e| {
            tracing::error!(attempts = self.max_retries + 1, error = %e, "All LLM retry attempts failed");
            LlmError::RetryExhausted {
                attempts: self.max_retries + 1,
                last: e.to_string(),
            }
        })
    }

    async fn post_once(&self, body: &CompletionRequest<'_>) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::warn!(code = status.as_u16(), message = %message, "LLM API error");
            return Err(LlmError::Api {
                code: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl AgentRouter for LlmRouter {
    async fn route(
        &self,
        registry: &AgentRegistry,
        request: RouteRequest<'_>,
    ) -> Result<RouteOutcome, LlmError> {
        let agent = self.classify(registry, &request).await?;
        let output = self.generate(agent, &request).await?;
        Ok(RouteOutcome {
            agent: agent.name.clone(),
            output,
        })
    }
}

/// First registered agent name found in the classifier's reply.
pub fn resolve_agent<'r>(
    registry: &'r AgentRegistry,
    reply: &str,
    addressee: &str,
) -> &'r AgentDescriptor {
    reply
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .filter(|token| !token.is_empty())
        .find_map(|token| registry.get(token))
        .or_else(|| registry.get(addressee))
        .unwrap_or_else(|| registry.default_agent())
}

// ============================================================================
// SSE parsing
// ============================================================================

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|c| !c.is_empty())
            .map(SseEvent::Delta)
            .unwrap_or(SseEvent::Ignore),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable SSE data line");
            SseEvent::Ignore
        }
    }
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl SseState {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            match parse_sse_line(&String::from_utf8_lossy(&line)) {
                SseEvent::Delta(text) => self.pending.push_back(text),
                SseEvent::Done => {
                    self.done = true;
                    return;
                }
                SseEvent::Ignore => {}
            }
        }
    }
}

/// Lazily turn an SSE completion response into its text deltas.
fn sse_text_stream(response: reqwest::Response) -> BoxStream<'static, Result<String, LlmError>> {
    let state = SseState {
        bytes: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(text) = st.pending.pop_front() {
                return Some((Ok(text), st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buffer.extend_from_slice(&chunk);
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(LlmError::Http(e)), st));
                }
                None => {
                    st.buffer.push(b'\n');
                    st.drain_lines();
                    st.done = true;
                }
            }
        }
    })
    .boxed()
}
