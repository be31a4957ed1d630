use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, SqlitePool, migrate::Migrator};

use crate::error::{BrokerError, BrokerResult};
use crate::models::{MessageRecord, OutgoingMessage, SequenceNumber, SubQueue};

// Embed migrations from the `migrations` directory
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntityRow {
    pub id: i64,
    pub path: String,
    pub kind: String,
    pub name: String,
    pub topic_id: Option<i64>,
    pub status: String,
    pub lock_duration_ms: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub sequence_number: i64,
    pub message_id: String,
    pub body_json: String,
    pub properties_json: String,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub enqueued_at: i64,
    pub delivery_count: i64,
    pub lock_token: Option<String>,
    pub locked_until: Option<i64>,
    pub dead_letter_reason: Option<String>,
}

impl MessageRow {
    pub fn into_record(self) -> BrokerResult<MessageRecord> {
        Ok(MessageRecord {
            message_id: self.message_id,
            sequence_number: self.sequence_number,
            body: serde_json::from_str(&self.body_json)?,
            properties: serde_json::from_str(&self.properties_json)?,
            enqueued_time: from_millis(self.enqueued_at),
            correlation_id: self.correlation_id,
            content_type: self.content_type,
            subject: self.subject,
            delivery_count: self.delivery_count,
            dead_letter_reason: self.dead_letter_reason,
        })
    }
}

const MESSAGE_COLUMNS: &str = "sequence_number, message_id, body_json, properties_json, \
     correlation_id, content_type, subject, enqueued_at, delivery_count, lock_token, \
     locked_until, dead_letter_reason";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Open a pool on a SQLite URL and bring the schema up to date.
///
/// With `create_if_missing = false` a missing database file is a connection
/// error, which is how an invalid credential surfaces.
pub async fn open_pool(url: &str, create_if_missing: bool) -> BrokerResult<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(url)
        .map_err(|e| BrokerError::InvalidCredential(e.to_string()))?
        .create_if_missing(create_if_missing)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);
    let mut pool_opts = SqlitePoolOptions::new();
    if url.contains(":memory:") {
        // every connection to :memory: is a separate database
        pool_opts = pool_opts.max_connections(1);
    }
    let pool = pool_opts.connect_with(opts).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

pub async fn get_entity(pool: &SqlitePool, path: &str) -> sqlx::Result<Option<EntityRow>> {
    sqlx::query_as::<_, EntityRow>(
        "SELECT id, path, kind, name, topic_id, status, lock_duration_ms, created_at
         FROM entity WHERE path = ?",
    )
    .bind(path)
    .fetch_optional(pool)
    .await
}

pub async fn insert_entity(
    pool: &SqlitePool,
    path: &str,
    kind: &str,
    name: &str,
    topic_id: Option<i64>,
    lock_duration_ms: i64,
) -> sqlx::Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO entity (path, kind, name, topic_id, lock_duration_ms, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(path)
    .bind(kind)
    .bind(name)
    .bind(topic_id)
    .bind(lock_duration_ms)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(rec.last_insert_rowid())
}

/// List entities of one kind, optionally restricted to a parent topic.
pub async fn list_entities(
    pool: &SqlitePool,
    kind: &str,
    topic_id: Option<i64>,
) -> sqlx::Result<Vec<EntityRow>> {
    sqlx::query_as::<_, EntityRow>(
        "SELECT id, path, kind, name, topic_id, status, lock_duration_ms, created_at
         FROM entity
         WHERE kind = ? AND (? IS NULL OR topic_id = ?)
         ORDER BY name",
    )
    .bind(kind)
    .bind(topic_id)
    .bind(topic_id)
    .fetch_all(pool)
    .await
}

/// Delete an entity (and, by cascade, its subscriptions and messages)
pub async fn delete_entity(pool: &SqlitePool, path: &str) -> sqlx::Result<u64> {
    let res = sqlx::query("DELETE FROM entity WHERE path = ?")
        .bind(path)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Count messages of the given entities split into (active, dead-letter).
pub async fn count_messages(pool: &SqlitePool, entity_ids: &[i64]) -> sqlx::Result<(i64, i64)> {
    let mut active = 0;
    let mut dead_letter = 0;
    for id in entity_ids {
        let (a, d): (i64, i64) = sqlx::query_as(
            "SELECT
                 COALESCE(SUM(CASE WHEN sub_queue = 'active' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN sub_queue = 'deadletter' THEN 1 ELSE 0 END), 0)
             FROM message WHERE entity_id = ?",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        active += a;
        dead_letter += d;
    }
    Ok((active, dead_letter))
}

/// Count messages currently held under an unexpired lock
pub async fn count_locked(pool: &SqlitePool, entity_id: i64, now_ms: i64) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM message
         WHERE entity_id = ? AND lock_token IS NOT NULL AND locked_until > ?",
    )
    .bind(entity_id)
    .bind(now_ms)
    .fetch_one(pool)
    .await
}

pub async fn insert_message<'e, E>(
    exec: E,
    entity_id: i64,
    message_id: &str,
    msg: &OutgoingMessage,
    enqueued_at: i64,
) -> BrokerResult<SequenceNumber>
where
    E: Executor<'e, Database = Sqlite>,
{
    let body = serde_json::to_string(&msg.body)?;
    let properties = serde_json::to_string(&msg.properties)?;
    let rec = sqlx::query(
        "INSERT INTO message (entity_id, sub_queue, message_id, body_json, properties_json,
                              correlation_id, content_type, subject, enqueued_at)
         VALUES (?, 'active', ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entity_id)
    .bind(message_id)
    .bind(body)
    .bind(properties)
    .bind(&msg.correlation_id)
    .bind(&msg.content_type)
    .bind(&msg.subject)
    .bind(enqueued_at)
    .execute(exec)
    .await?;
    Ok(rec.last_insert_rowid())
}

/// Peek messages in broker order without touching locks
pub async fn peek_messages(
    pool: &SqlitePool,
    entity_id: i64,
    sub_queue: SubQueue,
    skip: i64,
    limit: i64,
) -> sqlx::Result<Vec<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM message
         WHERE entity_id = ? AND sub_queue = ?
         ORDER BY sequence_number
         LIMIT ? OFFSET ?"
    ))
    .bind(entity_id)
    .bind(sub_queue.as_str())
    .bind(limit)
    .bind(skip)
    .fetch_all(pool)
    .await
}

/// Atomically lock up to `limit` unlocked (or lock-expired) messages under `token`.
pub async fn lock_batch(
    pool: &SqlitePool,
    entity_id: i64,
    sub_queue: SubQueue,
    limit: i64,
    token: &str,
    now_ms: i64,
    locked_until: i64,
) -> sqlx::Result<Vec<MessageRow>> {
    let mut rows = sqlx::query_as::<_, MessageRow>(&format!(
        "UPDATE message
         SET lock_token = ?, locked_until = ?, delivery_count = delivery_count + 1
         WHERE sequence_number IN (
             SELECT sequence_number FROM message
             WHERE entity_id = ? AND sub_queue = ?
               AND (locked_until IS NULL OR locked_until <= ?)
             ORDER BY sequence_number
             LIMIT ?
         )
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(token)
    .bind(locked_until)
    .bind(entity_id)
    .bind(sub_queue.as_str())
    .bind(now_ms)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    // RETURNING order is unspecified
    rows.sort_by_key(|r| r.sequence_number);
    Ok(rows)
}

/// Delete a message iff `token` still holds its lock
pub async fn complete_message(
    pool: &SqlitePool,
    seq: SequenceNumber,
    token: &str,
    now_ms: i64,
) -> sqlx::Result<u64> {
    let res = sqlx::query(
        "DELETE FROM message
         WHERE sequence_number = ? AND lock_token = ? AND locked_until > ?",
    )
    .bind(seq)
    .bind(token)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Clear the lock iff `token` is still the current holder
pub async fn release_lock(pool: &SqlitePool, seq: SequenceNumber, token: &str) -> sqlx::Result<u64> {
    let res = sqlx::query(
        "UPDATE message SET lock_token = NULL, locked_until = NULL
         WHERE sequence_number = ? AND lock_token = ?",
    )
    .bind(seq)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Move a locked message to the dead-letter sub-queue
pub async fn dead_letter_message(
    pool: &SqlitePool,
    seq: SequenceNumber,
    token: &str,
    now_ms: i64,
    reason: &str,
) -> sqlx::Result<u64> {
    let res = sqlx::query(
        "UPDATE message
         SET sub_queue = 'deadletter', lock_token = NULL, locked_until = NULL,
             dead_letter_reason = ?
         WHERE sequence_number = ? AND lock_token = ? AND locked_until > ?",
    )
    .bind(reason)
    .bind(seq)
    .bind(token)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}
