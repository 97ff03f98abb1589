use crate::config::DatabaseConfig;
use crate::error::ChorusError;
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Idempotent schema. Tables mirror the key shapes of the records they hold
/// (`pk`/`sk` pairs) so the item helpers stay simple lookups.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS chat_messages (
        pk           TEXT        NOT NULL,
        sk           TEXT        NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL,
        created_by   TEXT        NOT NULL,
        message      TEXT        NOT NULL,
        ttl          BIGINT      NOT NULL,
        session_id   TEXT        NOT NULL,
        character_id TEXT        NOT NULL,
        PRIMARY KEY (pk, sk)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS chat_messages_ttl_idx ON chat_messages (ttl)",
    r#"
    CREATE TABLE IF NOT EXISTS agent_wallets (
        pk             TEXT NOT NULL,
        sk             TEXT NOT NULL,
        wallet_address TEXT NOT NULL,
        PRIMARY KEY (pk, sk)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS connections (
        pk            TEXT        NOT NULL,
        sk            TEXT        NOT NULL,
        connection_id TEXT        NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        ttl           BIGINT      NOT NULL,
        PRIMARY KEY (pk, sk)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_requests (
        request_id  UUID        PRIMARY KEY,
        session_id  TEXT        NOT NULL,
        user_id     TEXT        NOT NULL,
        query       TEXT        NOT NULL,
        status      TEXT        NOT NULL,
        error       TEXT,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dispatch_queue (
        id            UUID        PRIMARY KEY,
        body          JSONB       NOT NULL,
        receive_count INTEGER     NOT NULL DEFAULT 0,
        visible_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        dead_letter   BOOLEAN     NOT NULL DEFAULT FALSE,
        last_error    TEXT,
        enqueued_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS dispatch_queue_visible_idx ON dispatch_queue (visible_at) WHERE NOT dead_letter",
];

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = SCHEMA.len(), "Database schema ensured");
    Ok(())
}

/// Connect and bring the schema up to date.
pub async fn open(config: &DatabaseConfig) -> Result<PgPool, ChorusError> {
    let pool = create_pool(config).await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}
