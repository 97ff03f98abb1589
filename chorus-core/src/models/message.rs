use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One stored chat message. Append-only: written once, never updated, expires via `ttl`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "PK")]
    pub pk: String,
    #[serde(rename = "SK")]
    pub sk: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub message: String,
    pub ttl: i64,
    pub session_id: String,
    pub character_id: String,
}

impl ChatMessage {
    /// Build a new record keyed by session, with a timestamp-qualified sort key.
    pub fn new(
        session_id: &str,
        created_by: &str,
        character_id: &str,
        message: &str,
        now: DateTime<Utc>,
        ttl_days: i64,
    ) -> Self {
        Self {
            pk: session_id.to_string(),
            sk: sort_key(now),
            created_at: now,
            created_by: created_by.to_string(),
            message: message.to_string(),
            ttl: super::ttl_after(now, ttl_days),
            session_id: session_id.to_string(),
            character_id: character_id.to_string(),
        }
    }
}

/// Zero-padded millis keep lexical order equal to chronological order;
/// the uuid suffix keeps two writes in the same millisecond distinct.
pub fn sort_key(now: DateTime<Utc>) -> String {
    format!("{:013}#{}", now.timestamp_millis(), Uuid::new_v4().simple())
}
