use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether an agent's reply is fed back in as the next inbound message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatMode {
    #[default]
    Standard,
    Recursive,
}

/// Unit of work carried by the dispatch queue.
///
/// The mode is fixed for the whole recursive chain started from this payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    pub session_id: String,
    /// Originating user. Also the author of the first hop's inbound message.
    pub created_by: String,
    /// Character the message is addressed to.
    pub character_id: String,
    #[serde(default)]
    pub chat_mode: ChatMode,
    #[serde(default)]
    pub senders_wallet_address: Option<String>,
    #[serde(default)]
    pub token_address: Option<String>,
    #[serde(default)]
    pub chain_id: Option<u64>,
    pub data: String,
    #[serde(default)]
    pub recursion_depth: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub domain_name: Option<String>,
}

/// Generation parameters forwarded to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl DispatchPayload {
    pub fn new(
        session_id: impl Into<String>,
        created_by: impl Into<String>,
        character_id: impl Into<String>,
        chat_mode: ChatMode,
        data: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            created_by: created_by.into(),
            character_id: character_id.into(),
            chat_mode,
            senders_wallet_address: None,
            token_address: None,
            chain_id: None,
            data: data.into(),
            recursion_depth: 0,
            temperature: None,
            max_tokens: None,
            top_p: None,
            request_id: None,
            connection_id: None,
            stage: None,
            domain_name: None,
        }
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
        }
    }

    /// Reject payloads missing the fields every hop depends on.
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("sessionId", &self.session_id),
            ("createdBy", &self.created_by),
            ("characterId", &self.character_id),
            ("data", &self.data),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", field));
            }
        }
        Ok(())
    }
}
