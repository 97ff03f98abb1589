use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RequestStatus::Queued),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            _ => None,
        }
    }
}

/// Tracking record for a call submitted over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub request_id: Uuid,
    pub session_id: String,
    pub user_id: String,
    pub query: String,
    pub status: RequestStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentRequest {
    pub fn queued(request_id: Uuid, session_id: &str, user_id: &str, query: &str) -> Self {
        Self {
            request_id,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            query: query.to_string(),
            status: RequestStatus::Queued,
            error: None,
            created_at: Utc::now(),
        }
    }
}
