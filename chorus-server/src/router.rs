use chorus_core::models::DispatchPayload;
use chorus_core::protocol::{ClientRequest, SendMessageParams, ServerFrame};

use crate::http::AppState;

/// Identity of one open socket, fixed at upgrade time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub session_id: String,
    pub character_id: String,
    pub user_id: String,
}

/// Route one inbound text frame by its `action` and produce the reply frame.
pub async fn handle_client_message(state: &AppState, ctx: &ConnectionContext, text: &str) -> ServerFrame {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(connection_id = %ctx.connection_id, error = %e, "Unroutable client frame");
            return ServerFrame::error(format!("Invalid request: {}", e));
        }
    };

    match request {
        ClientRequest::Ping => ServerFrame::Pong,
        ClientRequest::SendMessage(params) => handle_send_message(state, ctx, params).await,
    }
}

async fn handle_send_message(
    state: &AppState,
    ctx: &ConnectionContext,
    params: SendMessageParams,
) -> ServerFrame {
    if let Some(claimed) = params.created_by.as_deref() {
        if claimed != ctx.user_id {
            tracing::warn!(
                connection_id = %ctx.connection_id,
                user_id = %ctx.user_id,
                claimed,
                "Rejected sendMessage with foreign author"
            );
            return ServerFrame::error("createdBy must match the authenticated user");
        }
    }

    let mut payload = DispatchPayload::new(
        &ctx.session_id,
        &ctx.user_id,
        &ctx.character_id,
        params.chat_mode,
        &params.data,
    );
    payload.senders_wallet_address = params.senders_wallet_address;
    payload.temperature = params.temperature;
    payload.max_tokens = params.max_tokens;
    payload.top_p = params.top_p;
    payload.connection_id = Some(ctx.connection_id.clone());

    if let Err(e) = payload.validate() {
        return ServerFrame::error(e);
    }

    let body = match serde_json::to_value(&payload) {
        Ok(b) => b,
        Err(e) => return ServerFrame::error(format!("Serialization error: {}", e)),
    };

    match state.queue.enqueue(body).await {
        Ok(message_id) => {
            tracing::info!(
                connection_id = %ctx.connection_id,
                session_id = %ctx.session_id,
                message_id = %message_id,
                mode = ?payload.chat_mode,
                "Message queued"
            );
            ServerFrame::Queued { message_id }
        }
        Err(e) => {
            tracing::error!(connection_id = %ctx.connection_id, error = %e, "Enqueue failed");
            ServerFrame::error("Could not queue message")
        }
    }
}
