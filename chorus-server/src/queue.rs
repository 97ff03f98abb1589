//! Durable work queue between the intake surfaces and the dispatch consumer.
//!
//! Delivery is at-least-once. A received message is hidden for the
//! visibility timeout; if it is neither acked nor failed before then it
//! becomes receivable again. A message that has been received
//! `max_receive_count` times and fails again moves to the dead-letter set.
//! Consumers holding a message longer than the timeout call
//! `extend_visibility` to keep it hidden.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown message: {0}")]
    UnknownMessage(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: Uuid,
    pub body: serde_json::Value,
    /// Times this message has been handed out, including this one.
    pub receive_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Message will become visible again after the visibility timeout.
    Retry,
    DeadLettered,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, body: serde_json::Value) -> Result<Uuid, QueueError>;

    /// Claim up to `max` visible messages and hide them for the visibility timeout.
    async fn receive(&self, max: u32) -> Result<Vec<QueueMessage>, QueueError>;

    async fn ack(&self, id: Uuid) -> Result<(), QueueError>;

    /// Restart the visibility timeout of a message still being processed.
    async fn extend_visibility(&self, id: Uuid) -> Result<(), QueueError>;

    /// Record a processing failure.
    async fn fail(&self, id: Uuid, error: &str) -> Result<FailOutcome, QueueError>;

    /// Move a message straight to the dead-letter set.
    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError>;

    /// Number of live (not dead-lettered) messages.
    async fn depth(&self) -> Result<i64, QueueError>;

    async fn dead_letter_count(&self) -> Result<i64, QueueError>;
}

// ============================================================================
// PgQueue
// ============================================================================

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    visibility_timeout_seconds: i64,
    max_receive_count: i32,
}

impl PgQueue {
    pub fn new(pool: PgPool, visibility_timeout_seconds: i64, max_receive_count: i32) -> Self {
        Self {
            pool,
            visibility_timeout_seconds,
            max_receive_count,
        }
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn enqueue(&self, body: serde_json::Value) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO dispatch_queue (id, body) VALUES ($1, $2)")
            .bind(id)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn receive(&self, max: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let rows: Vec<(Uuid, serde_json::Value, i32)> = sqlx::query_as(
            r#"
            UPDATE dispatch_queue
            SET receive_count = receive_count + 1,
                visible_at = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id FROM dispatch_queue
                WHERE NOT dead_letter AND visible_at <= NOW()
                ORDER BY enqueued_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, body, receive_count
            "#,
        )
        .bind(max as i64)
        .bind(self.visibility_timeout_seconds as f64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, body, receive_count)| QueueMessage {
                id,
                body,
                receive_count,
            })
            .collect())
    }

    async fn ack(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM dispatch_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn extend_visibility(&self, id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE dispatch_queue SET visible_at = NOW() + make_interval(secs => $2) \
             WHERE id = $1 AND NOT dead_letter",
        )
        .bind(id)
        .bind(self.visibility_timeout_seconds as f64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownMessage(id));
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        let dead: Option<bool> = sqlx::query_scalar(
            r#"
            UPDATE dispatch_queue
            SET last_error = $2,
                dead_letter = receive_count >= $3
            WHERE id = $1
            RETURNING dead_letter
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(self.max_receive_count)
        .fetch_optional(&self.pool)
        .await?;

        match dead {
            Some(true) => Ok(FailOutcome::DeadLettered),
            Some(false) => Ok(FailOutcome::Retry),
            None => Err(QueueError::UnknownMessage(id)),
        }
    }

    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        sqlx::query("UPDATE dispatch_queue SET dead_letter = TRUE, last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn depth(&self) -> Result<i64, QueueError> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*)::bigint FROM dispatch_queue WHERE NOT dead_letter")
                .fetch_one(&self.pool)
                .await?;
        Ok(n)
    }

    async fn dead_letter_count(&self) -> Result<i64, QueueError> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*)::bigint FROM dispatch_queue WHERE dead_letter")
                .fetch_one(&self.pool)
                .await?;
        Ok(n)
    }
}

// ============================================================================
// MemoryQueue
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    id: Uuid,
    body: serde_json::Value,
    receive_count: i32,
    visible_at: DateTime<Utc>,
    last_error: Option<String>,
}

/// In-process queue with the same visibility and dead-letter rules.
pub struct MemoryQueue {
    live: Mutex<Vec<Entry>>,
    dead: Mutex<Vec<Entry>>,
    visibility_timeout: chrono::Duration,
    max_receive_count: i32,
}

impl MemoryQueue {
    pub fn new(visibility_timeout_seconds: i64, max_receive_count: i32) -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            dead: Mutex::new(Vec::new()),
            visibility_timeout: chrono::Duration::seconds(visibility_timeout_seconds),
            max_receive_count,
        }
    }

    /// Bodies and last errors of dead-lettered messages.
    pub async fn dead_letters(&self) -> Vec<(serde_json::Value, Option<String>)> {
        self.dead
            .lock()
            .await
            .iter()
            .map(|e| (e.body.clone(), e.last_error.clone()))
            .collect()
    }

    /// Make every hidden message visible immediately.
    pub async fn expire_visibility(&self) {
        let now = Utc::now();
        for entry in self.live.lock().await.iter_mut() {
            entry.visible_at = now;
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, body: serde_json::Value) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        self.live.lock().await.push(Entry {
            id,
            body,
            receive_count: 0,
            visible_at: Utc::now(),
            last_error: None,
        });
        Ok(id)
    }

    async fn receive(&self, max: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let now = Utc::now();
        let mut live = self.live.lock().await;
        let mut out = Vec::new();
        for entry in live.iter_mut() {
            if out.len() as u32 >= max {
                break;
            }
            if entry.visible_at <= now {
                entry.receive_count += 1;
                entry.visible_at = now + self.visibility_timeout;
                out.push(QueueMessage {
                    id: entry.id,
                    body: entry.body.clone(),
                    receive_count: entry.receive_count,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, id: Uuid) -> Result<(), QueueError> {
        self.live.lock().await.retain(|e| e.id != id);
        Ok(())
    }

    async fn extend_visibility(&self, id: Uuid) -> Result<(), QueueError> {
        let mut live = self.live.lock().await;
        let entry = live
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(QueueError::UnknownMessage(id))?;
        entry.visible_at = Utc::now() + self.visibility_timeout;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        let mut live = self.live.lock().await;
        let pos = live
            .iter()
            .position(|e| e.id == id)
            .ok_or(QueueError::UnknownMessage(id))?;
        live[pos].last_error = Some(error.to_string());
        if live[pos].receive_count >= self.max_receive_count {
            let entry = live.remove(pos);
            self.dead.lock().await.push(entry);
            Ok(FailOutcome::DeadLettered)
        } else {
            Ok(FailOutcome::Retry)
        }
    }

    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let mut live = self.live.lock().await;
        if let Some(pos) = live.iter().position(|e| e.id == id) {
            let mut entry = live.remove(pos);
            entry.last_error = Some(error.to_string());
            self.dead.lock().await.push(entry);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<i64, QueueError> {
        Ok(self.live.lock().await.len() as i64)
    }

    async fn dead_letter_count(&self) -> Result<i64, QueueError> {
        Ok(self.dead.lock().await.len() as i64)
    }
}
