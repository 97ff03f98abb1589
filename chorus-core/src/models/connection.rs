use serde::{Deserialize, Serialize};

/// Live delivery handle for a (session, character) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    #[serde(rename = "PK")]
    pub pk: String,
    #[serde(rename = "SK")]
    pub sk: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    pub ttl: i64,
}

impl Connection {
    pub fn new(session_id: &str, character_id: &str, connection_id: &str, ttl: i64) -> Self {
        Self {
            pk: partition_key(session_id),
            sk: sort_key(character_id),
            connection_id: connection_id.to_string(),
            ttl,
        }
    }
}

pub fn partition_key(session_id: &str) -> String {
    format!("session#{}", session_id)
}

pub fn sort_key(character_id: &str) -> String {
    format!("character#{}", character_id)
}
