//! Chorus HTTP API
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, serde_json::Value)`, so the logic is testable
//! without going through the router.
//!
//! Endpoints:
//! - GET /health                              DB status, queue and dead-letter depth
//! - GET /version                             server version info
//! - GET /v1/callAgent                        queue a message for the agents
//! - GET /v1/requests/:request_id             tracking record of a queued call
//! - GET /v1/sessions/:session_id/messages    session message history
//! - GET /ws                                  WebSocket upgrade

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chorus_core::models::{AgentRequest, ChatMode, DispatchPayload};
use chorus_core::{AgentRegistry, ChorusConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::{bearer_token, TokenVerifier};
use crate::delivery::ConnectionHub;
use crate::queue::WorkQueue;
use crate::store::ConversationStore;

const HISTORY_DEFAULT_LIMIT: u32 = 50;
const HISTORY_MAX_LIMIT: u32 = 200;

/// Shared state for all HTTP and WebSocket handlers
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub hub: Arc<ConnectionHub>,
    pub registry: Arc<AgentRegistry>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: ChorusConfig,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/v1/callAgent", get(call_agent_handler))
        .route("/v1/requests/:request_id", get(request_status_handler))
        .route("/v1/sessions/:session_id/messages", get(session_messages_handler))
        .route("/ws", get(crate::server::ws_handler))
        .with_state(state)
}

/// Serve on the configured address until the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Chorus HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs and errors
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallAgentParams {
    pub query: Option<String>,
    pub wallet_address: Option<String>,
    pub token_address: Option<String>,
    pub chain_id: Option<String>,
    pub character_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryParams {
    pub limit: Option<u32>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn into_response_parts(self) -> (StatusCode, serde_json::Value) {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, json!({ "message": message })),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, json!({ "message": "Unauthorized" })),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, json!({ "message": message })),
            ApiError::Internal(detail) => {
                let error_id = Uuid::new_v4();
                tracing::error!(error_id = %error_id, error = %detail, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "message": "Internal server error",
                        "errorId": error_id,
                    }),
                )
            }
        }
    }
}

fn respond(result: std::result::Result<serde_json::Value, ApiError>) -> (StatusCode, serde_json::Value) {
    match result {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => e.into_response_parts(),
    }
}

/// User identity behind the request's bearer token.
pub fn authenticate(verifier: &dyn TokenVerifier, headers: &HeaderMap) -> std::result::Result<String, ApiError> {
    bearer_token(headers)
        .and_then(|token| verifier.verify(token))
        .ok_or(ApiError::Unauthorized)
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn health_inner(state: &AppState) -> (StatusCode, serde_json::Value) {
    let database = match state.store.health().await {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                }),
            );
        }
    };

    let queue_depth = match state.queue.depth().await {
        Ok(n) => json!(n),
        Err(e) => json!(format!("unavailable: {}", e)),
    };
    let dead_letters = match state.queue.dead_letter_count().await {
        Ok(n) => json!(n),
        Err(e) => json!(format!("unavailable: {}", e)),
    };

    (
        StatusCode::OK,
        json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
            "queueDepth": queue_depth,
            "deadLetters": dead_letters,
            "connections": state.hub.len().await,
        }),
    )
}

pub fn version_inner() -> serde_json::Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "chorus/1",
    })
}

/// Validate and queue one agent call.
pub async fn call_agent_inner(
    state: &AppState,
    headers: &HeaderMap,
    params: CallAgentParams,
) -> (StatusCode, serde_json::Value) {
    respond(call_agent(state, headers, params).await)
}

async fn call_agent(
    state: &AppState,
    headers: &HeaderMap,
    params: CallAgentParams,
) -> std::result::Result<serde_json::Value, ApiError> {
    let user_id = authenticate(state.verifier.as_ref(), headers)?;

    let query = match params.query {
        Some(q) if !q.trim().is_empty() => q,
        _ => return Err(ApiError::BadRequest("query parameter is required".to_string())),
    };

    let chain_id = match params.chain_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| ApiError::BadRequest(format!("invalid chainId: {}", raw)))?,
        ),
    };

    let character_id = match params.character_id.as_deref() {
        Some(name) if !name.trim().is_empty() => state
            .registry
            .get(name)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown characterId: {}", name)))?
            .name
            .clone(),
        _ => state.registry.default_agent().name.clone(),
    };

    let session_id = params
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let request_id = Uuid::new_v4();

    let mut payload = DispatchPayload::new(
        &session_id,
        &user_id,
        &character_id,
        ChatMode::Standard,
        &query,
    );
    payload.senders_wallet_address = params.wallet_address.filter(|w| !w.trim().is_empty());
    payload.token_address = params.token_address.filter(|t| !t.trim().is_empty());
    payload.chain_id = chain_id;
    payload.request_id = Some(request_id);

    state
        .store
        .create_request(&AgentRequest::queued(request_id, &session_id, &user_id, &query))
        .await
        .map_err(|e| ApiError::Internal(format!("create request record: {}", e)))?;

    let body = serde_json::to_value(&payload)
        .map_err(|e| ApiError::Internal(format!("serialize payload: {}", e)))?;
    state
        .queue
        .enqueue(body)
        .await
        .map_err(|e| ApiError::Internal(format!("enqueue: {}", e)))?;

    tracing::info!(
        request_id = %request_id,
        session_id = %session_id,
        user_id = %user_id,
        character_id = %character_id,
        "Agent call queued"
    );

    Ok(json!({
        "requestId": request_id,
        "sessionId": session_id,
        "status": "queued",
        "message": "Request queued for processing",
        "estimatedProcessingTime": "30 seconds",
    }))
}

pub async fn request_status_inner(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
) -> (StatusCode, serde_json::Value) {
    respond(request_status(state, headers, request_id).await)
}

async fn request_status(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
) -> std::result::Result<serde_json::Value, ApiError> {
    authenticate(state.verifier.as_ref(), headers)?;
    let id = Uuid::parse_str(request_id)
        .map_err(|_| ApiError::BadRequest(format!("invalid request id: {}", request_id)))?;
    let record = state
        .store
        .get_request(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("request {} not found", id)))?;
    serde_json::to_value(record).map_err(|e| ApiError::Internal(e.to_string()))
}

pub async fn session_messages_inner(
    state: &AppState,
    headers: &HeaderMap,
    session_id: &str,
    params: HistoryParams,
) -> (StatusCode, serde_json::Value) {
    respond(session_messages(state, headers, session_id, params).await)
}

async fn session_messages(
    state: &AppState,
    headers: &HeaderMap,
    session_id: &str,
    params: HistoryParams,
) -> std::result::Result<serde_json::Value, ApiError> {
    authenticate(state.verifier.as_ref(), headers)?;
    let limit = params
        .limit
        .unwrap_or(HISTORY_DEFAULT_LIMIT)
        .clamp(1, HISTORY_MAX_LIMIT);
    let messages = state
        .store
        .recent_messages(session_id, limit)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(json!({
        "sessionId": session_id,
        "count": messages.len(),
        "messages": messages,
    }))
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn call_agent_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<CallAgentParams>,
) -> impl IntoResponse {
    let (status, body) = call_agent_inner(&state, &headers, params).await;
    (status, Json(body))
}

pub async fn request_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = request_status_inner(&state, &headers, &request_id).await;
    (status, Json(body))
}

pub async fn session_messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let (status, body) = session_messages_inner(&state, &headers, &session_id, params).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;
    use axum::http::{header, HeaderValue};
    use std::collections::HashMap;

    fn state_with(queue: Arc<MemoryQueue>) -> AppState {
        let config = ChorusConfig::from_toml_str(
            r#"
            [service]
            log_level = "info"
            [database]
            url = "postgres://unused"
            max_connections = 1
            [llm]
            base_url = "http://localhost"
            classifier_model = "m"
            default_model = "m"
            "#,
        )
        .unwrap();
        AppState {
            store: Arc::new(MemoryStore::new()),
            queue,
            hub: Arc::new(ConnectionHub::new()),
            registry: Arc::new(AgentRegistry::standard("m", "m")),
            verifier: Arc::new(StaticTokenVerifier::new(HashMap::from([(
                "secret".to_string(),
                "alice".to_string(),
            )]))),
            config,
        }
    }

    fn authed() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        h
    }

    fn params(query: &str) -> CallAgentParams {
        CallAgentParams {
            query: Some(query.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string());
        assert_eq!(v["protocol"], "chorus/1");
    }

    #[tokio::test]
    async fn test_call_agent_requires_token() {
        let queue = Arc::new(MemoryQueue::new(300, 2));
        let state = state_with(queue.clone());
        let (status, body) = call_agent_inner(&state, &HeaderMap::new(), params("hi")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["message"].is_string());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_call_agent_rejects_blank_query() {
        let state = state_with(Arc::new(MemoryQueue::new(300, 2)));
        let (status, body) = call_agent_inner(&state, &authed(), params("   ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "query parameter is required");
    }

    #[tokio::test]
    async fn test_call_agent_queues_standard_payload() {
        let queue = Arc::new(MemoryQueue::new(300, 2));
        let state = state_with(queue.clone());
        let mut p = params("gm");
        p.wallet_address = Some("0xUSER".to_string());
        p.chain_id = Some("8453".to_string());
        p.character_id = Some("luna".to_string());

        let (status, body) = call_agent_inner(&state, &authed(), p).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "queued");
        assert!(body["sessionId"].is_string());

        let msg = queue.receive(1).await.unwrap().remove(0);
        let payload: DispatchPayload = serde_json::from_value(msg.body).unwrap();
        assert_eq!(payload.created_by, "alice");
        assert_eq!(payload.character_id, "Luna");
        assert_eq!(payload.chat_mode, ChatMode::Standard);
        assert_eq!(payload.chain_id, Some(8453));
        assert_eq!(payload.senders_wallet_address.as_deref(), Some("0xUSER"));
        assert_eq!(
            payload.request_id.map(|id| id.to_string()),
            body["requestId"].as_str().map(str::to_string)
        );
    }

    #[tokio::test]
    async fn test_call_agent_rejects_bad_chain_and_character() {
        let state = state_with(Arc::new(MemoryQueue::new(300, 2)));

        let mut p = params("gm");
        p.chain_id = Some("base".to_string());
        let (status, _) = call_agent_inner(&state, &authed(), p).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut p = params("gm");
        p.character_id = Some("Bob".to_string());
        let (status, _) = call_agent_inner(&state, &authed(), p).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_request_status_round_trip() {
        let state = state_with(Arc::new(MemoryQueue::new(300, 2)));
        let (_, body) = call_agent_inner(&state, &authed(), params("gm")).await;
        let id = body["requestId"].as_str().unwrap().to_string();

        let (status, record) = request_status_inner(&state, &authed(), &id).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], "queued");
        assert_eq!(record["userId"], "alice");

        let (status, _) = request_status_inner(&state, &authed(), &Uuid::new_v4().to_string()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = request_status_inner(&state, &authed(), "not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_internal_error_carries_error_id() {
        let (status, body) = ApiError::Internal("db down".to_string()).into_response_parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["errorId"].is_string());
        assert!(!body["message"].as_str().unwrap().contains("db down"));
    }
}
