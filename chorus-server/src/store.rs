//! Conversation persistence: messages, agent wallets, live connections and
//! request tracking records.
//!
//! `PgStore` is the production store. `MemoryStore` keeps the same semantics
//! in process and backs tests and local runs without a database.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chorus_core::models::{
    connection, wallet, AgentRequest, AgentWallet, ChatMessage, Connection, RequestStatus,
};
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Backend identification for health reporting.
    async fn health(&self) -> Result<String, StoreError>;

    async fn put_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Up to `limit` unexpired messages of a session, oldest first.
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    async fn put_wallet(&self, wallet: &AgentWallet) -> Result<(), StoreError>;

    async fn get_wallet(&self, user_id: &str, agent: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite the handle for (session, character).
    async fn put_connection(&self, connection: &Connection) -> Result<(), StoreError>;

    /// Unexpired connection id for (session, character).
    async fn get_connection(
        &self,
        session_id: &str,
        character_id: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn create_request(&self, request: &AgentRequest) -> Result<(), StoreError>;

    async fn get_request(&self, request_id: Uuid) -> Result<Option<AgentRequest>, StoreError>;

    async fn update_request_status(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Delete messages and connections whose ttl is at or before `now_unix`.
    /// Returns the number of rows removed.
    async fn delete_expired(&self, now_unix: i64) -> Result<u64, StoreError>;
}

// ============================================================================
// PgStore
// ============================================================================

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    request_id: Uuid,
    session_id: String,
    user_id: String,
    query: String,
    status: String,
    error: Option<String>,
    created_at: chrono::DateTime<Utc>,
}

impl TryFrom<RequestRow> for AgentRequest {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let status = RequestStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown request status {}", row.status)))?;
        Ok(AgentRequest {
            request_id: row.request_id,
            session_id: row.session_id,
            user_id: row.user_id,
            query: row.query,
            status,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn health(&self) -> Result<String, StoreError> {
        Ok(chorus_core::db::health_check(&self.pool).await?)
    }

    async fn put_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages
                (pk, sk, created_at, created_by, message, ttl, session_id, character_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&message.pk)
        .bind(&message.sk)
        .bind(message.created_at)
        .bind(&message.created_by)
        .bind(&message.message)
        .bind(message.ttl)
        .bind(&message.session_id)
        .bind(&message.character_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut rows: Vec<ChatMessage> = sqlx::query_as(
            r#"
            SELECT pk, sk, created_at, created_by, message, ttl, session_id, character_id
            FROM chat_messages
            WHERE pk = $1 AND ttl > $2
            ORDER BY sk DESC
            LIMIT $3
            "#,
        )
        .bind(session_id)
        .bind(Utc::now().timestamp())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn put_wallet(&self, wallet: &AgentWallet) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_wallets (pk, sk, wallet_address) VALUES ($1, $2, $3)
            ON CONFLICT (pk, sk) DO UPDATE SET wallet_address = EXCLUDED.wallet_address
            "#,
        )
        .bind(&wallet.pk)
        .bind(&wallet.sk)
        .bind(&wallet.wallet_address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_wallet(&self, user_id: &str, agent: &str) -> Result<Option<String>, StoreError> {
        let address: Option<String> = sqlx::query_scalar(
            "SELECT wallet_address FROM agent_wallets WHERE pk = $1 AND sk = $2",
        )
        .bind(wallet::WALLET_PARTITION)
        .bind(wallet::sort_key(user_id, agent))
        .fetch_optional(&self.pool)
        .await?;
        Ok(address)
    }

    async fn put_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO connections (pk, sk, connection_id, ttl) VALUES ($1, $2, $3, $4)
            ON CONFLICT (pk, sk) DO UPDATE
                SET connection_id = EXCLUDED.connection_id,
                    ttl = EXCLUDED.ttl,
                    created_at = NOW()
            "#,
        )
        .bind(&connection.pk)
        .bind(&connection.sk)
        .bind(&connection.connection_id)
        .bind(connection.ttl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_connection(
        &self,
        session_id: &str,
        character_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT connection_id FROM connections WHERE pk = $1 AND sk = $2 AND ttl > $3",
        )
        .bind(connection::partition_key(session_id))
        .bind(connection::sort_key(character_id))
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn create_request(&self, request: &AgentRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_requests (request_id, session_id, user_id, query, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(request.request_id)
        .bind(&request.session_id)
        .bind(&request.user_id)
        .bind(&request.query)
        .bind(request.status.as_str())
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<AgentRequest>, StoreError> {
        let row: Option<RequestRow> = sqlx::query_as(
            r#"
            SELECT request_id, session_id, user_id, query, status, error, created_at
            FROM agent_requests WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AgentRequest::try_from).transpose()
    }

    async fn update_request_status(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE agent_requests SET status = $2, error = $3, updated_at = NOW() WHERE request_id = $1",
        )
        .bind(request_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired(&self, now_unix: i64) -> Result<u64, StoreError> {
        let messages = sqlx::query("DELETE FROM chat_messages WHERE ttl <= $1")
            .bind(now_unix)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let connections = sqlx::query("DELETE FROM connections WHERE ttl <= $1")
            .bind(now_unix)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(messages + connections)
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    /// (pk, sk) -> message; BTreeMap keeps each session's messages in sort-key order.
    messages: RwLock<BTreeMap<(String, String), ChatMessage>>,
    wallets: RwLock<HashMap<(String, String), AgentWallet>>,
    connections: RwLock<HashMap<(String, String), Connection>>,
    requests: RwLock<HashMap<Uuid, AgentRequest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored message across sessions, in key order.
    pub async fn all_messages(&self) -> Vec<ChatMessage> {
        self.messages.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn health(&self) -> Result<String, StoreError> {
        Ok("in-memory".to_string())
    }

    async fn put_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.messages
            .write()
            .await
            .insert((message.pk.clone(), message.sk.clone()), message.clone());
        Ok(())
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let now = Utc::now().timestamp();
        let messages = self.messages.read().await;
        let mut recent: Vec<ChatMessage> = messages
            .values()
            .filter(|m| m.pk == session_id && m.ttl > now)
            .rev()
            .take(limit as usize)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn put_wallet(&self, wallet: &AgentWallet) -> Result<(), StoreError> {
        self.wallets
            .write()
            .await
            .insert((wallet.pk.clone(), wallet.sk.clone()), wallet.clone());
        Ok(())
    }

    async fn get_wallet(&self, user_id: &str, agent: &str) -> Result<Option<String>, StoreError> {
        let key = (
            wallet::WALLET_PARTITION.to_string(),
            wallet::sort_key(user_id, agent),
        );
        Ok(self
            .wallets
            .read()
            .await
            .get(&key)
            .map(|w| w.wallet_address.clone()))
    }

    async fn put_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        self.connections.write().await.insert(
            (connection.pk.clone(), connection.sk.clone()),
            connection.clone(),
        );
        Ok(())
    }

    async fn get_connection(
        &self,
        session_id: &str,
        character_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let key = (
            connection::partition_key(session_id),
            connection::sort_key(character_id),
        );
        let now = Utc::now().timestamp();
        Ok(self
            .connections
            .read()
            .await
            .get(&key)
            .filter(|c| c.ttl > now)
            .map(|c| c.connection_id.clone()))
    }

    async fn create_request(&self, request: &AgentRequest) -> Result<(), StoreError> {
        self.requests
            .write()
            .await
            .insert(request.request_id, request.clone());
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<AgentRequest>, StoreError> {
        Ok(self.requests.read().await.get(&request_id).cloned())
    }

    async fn update_request_status(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(request) = self.requests.write().await.get_mut(&request_id) {
            request.status = status;
            request.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn delete_expired(&self, now_unix: i64) -> Result<u64, StoreError> {
        let mut removed = 0u64;

        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|_, m| m.ttl > now_unix);
        removed += (before - messages.len()) as u64;
        drop(messages);

        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|_, c| c.ttl > now_unix);
        removed += (before - connections.len()) as u64;

        Ok(removed)
    }
}
