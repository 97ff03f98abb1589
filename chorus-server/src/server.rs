//! WebSocket entry point.
//!
//! Upgrading is the connect event: the socket gets a connection id, is
//! registered in the delivery hub and recorded as the live connection for its
//! (session, character). Closing is the disconnect event: the hub handle is
//! dropped and the record is left to expire.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chorus_core::models::Connection;
use chorus_core::protocol::ServerFrame;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::bearer_token;
use crate::http::AppState;
use crate::router::{self, ConnectionContext};

/// Connection records outlive the socket by this long unless refreshed.
const CONNECTION_TTL_HOURS: i64 = 24;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub session_id: Option<String>,
    pub character_id: Option<String>,
    /// Browsers cannot set headers on a WebSocket handshake.
    pub token: Option<String>,
}

/// Resolve who is connecting and to which (session, character).
pub fn connection_context(
    state: &AppState,
    headers: &HeaderMap,
    params: WsParams,
) -> Result<ConnectionContext, (StatusCode, serde_json::Value)> {
    let token = bearer_token(headers)
        .map(str::to_string)
        .or(params.token)
        .ok_or((StatusCode::UNAUTHORIZED, json!({ "message": "Unauthorized" })))?;
    let user_id = state
        .verifier
        .verify(&token)
        .ok_or((StatusCode::UNAUTHORIZED, json!({ "message": "Unauthorized" })))?;

    let session_id = params
        .session_id
        .filter(|s| !s.trim().is_empty())
        .ok_or((StatusCode::BAD_REQUEST, json!({ "message": "sessionId is required" })))?;
    let character = params.character_id.unwrap_or_default();
    let character_id = state
        .registry
        .get(&character)
        .ok_or((
            StatusCode::BAD_REQUEST,
            json!({ "message": format!("unknown characterId: {}", character) }),
        ))?
        .name
        .clone();

    Ok(ConnectionContext {
        connection_id: Uuid::new_v4().to_string(),
        session_id,
        character_id,
        user_id,
    })
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
) -> Response {
    match connection_context(&state, &headers, params) {
        Ok(ctx) => ws.on_upgrade(move |socket| handle_socket(socket, state, ctx)),
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, ctx: ConnectionContext) {
    let mut outbound = state.hub.register(&ctx.connection_id).await;
    let (mut sink, mut inbound) = socket.split();

    let ttl = (Utc::now() + chrono::Duration::hours(CONNECTION_TTL_HOURS)).timestamp();
    let record = Connection::new(&ctx.session_id, &ctx.character_id, &ctx.connection_id, ttl);
    if let Err(e) = state.store.put_connection(&record).await {
        tracing::error!(connection_id = %ctx.connection_id, error = %e, "Failed to record connection");
        let frame = ServerFrame::error("Could not register connection");
        let _ = sink.send(Message::Text(frame.to_json())).await;
        state.hub.unregister(&ctx.connection_id).await;
        return;
    }

    tracing::info!(
        connection_id = %ctx.connection_id,
        session_id = %ctx.session_id,
        character_id = %ctx.character_id,
        "Client connected"
    );

    let connected = ServerFrame::Connected {
        connection_id: ctx.connection_id.clone(),
        session_id: ctx.session_id.clone(),
        character_id: ctx.character_id.clone(),
    };
    if sink.send(Message::Text(connected.to_json())).await.is_err() {
        state.hub.unregister(&ctx.connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::debug!(connection_id = %ctx.connection_id, error = %e, "Socket write failed");
                    break;
                }
            }
            frame = inbound.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = router::handle_client_message(&state, &ctx, &text).await;
                        if sink.send(Message::Text(reply.to_json())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = ServerFrame::error("Binary frames are not supported");
                        if sink.send(Message::Text(reply.to_json())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %ctx.connection_id, error = %e, "Socket read failed");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(&ctx.connection_id).await;
    tracing::info!(connection_id = %ctx.connection_id, "Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::delivery::ConnectionHub;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;
    use axum::http::{header, HeaderValue};
    use chorus_core::{AgentRegistry, ChorusConfig};
    use std::collections::HashMap;

    fn state() -> AppState {
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
            queue: Arc::new(MemoryQueue::new(300, 2)),
            hub: Arc::new(ConnectionHub::new()),
            registry: Arc::new(AgentRegistry::standard("m", "m")),
            verifier: Arc::new(StaticTokenVerifier::new(HashMap::from([(
                "secret".to_string(),
                "alice".to_string(),
            )]))),
            config,
        }
    }

    fn params(session: Option<&str>, character: Option<&str>, token: Option<&str>) -> WsParams {
        WsParams {
            session_id: session.map(str::to_string),
            character_id: character.map(str::to_string),
            token: token.map(str::to_string),
        }
    }

    #[test]
    fn test_context_from_query_token() {
        let ctx = connection_context(
            &state(),
            &HeaderMap::new(),
            params(Some("s1"), Some("sage"), Some("secret")),
        )
        .unwrap();
        assert_eq!(ctx.user_id, "alice");
        assert_eq!(ctx.character_id, "Sage");
        assert_eq!(ctx.session_id, "s1");
        assert!(!ctx.connection_id.is_empty());
    }

    #[test]
    fn test_context_from_header_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(connection_context(&state(), &headers, params(Some("s1"), Some("Luna"), None)).is_ok());
    }

    #[test]
    fn test_context_rejections() {
        let s = state();
        let h = HeaderMap::new();

        let (status, _) = connection_context(&s, &h, params(Some("s1"), Some("Luna"), None)).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) =
            connection_context(&s, &h, params(Some("s1"), Some("Luna"), Some("wrong"))).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = connection_context(&s, &h, params(None, Some("Luna"), Some("secret"))).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = connection_context(&s, &h, params(Some("s1"), Some("Bob"), Some("secret"))).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
