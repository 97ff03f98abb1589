//! WebSocket wire protocol.
//!
//! Opening the socket is the connect event and closing it is the disconnect
//! event. Every text frame a client sends is a JSON object routed by its
//! `action` field; every frame the server sends carries a `type` field.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ChatMode;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientRequest {
    SendMessage(SendMessageParams),
    Ping,
}

/// Body of a `sendMessage` action. Session and character come from the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    pub data: String,
    #[serde(default)]
    pub chat_mode: ChatMode,
    #[serde(default)]
    pub senders_wallet_address: Option<String>,
    /// Must name the socket's authenticated user when present.
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        session_id: String,
        character_id: String,
    },
    /// One piece of a streamed agent reply.
    #[serde(rename_all = "camelCase")]
    Chunk { character_id: String, data: String },
    /// A complete agent reply.
    #[serde(rename_all = "camelCase")]
    Message { character_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Queued { message_id: Uuid },
    Pong,
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        character_id: Option<String>,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            character_id: None,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","message":"serialization failed"}"#.to_string())
    }
}
