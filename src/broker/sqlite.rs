//! Local lock-based broker backed by SQLite.
//!
//! Gives the console something real to connect to without a cloud
//! namespace: queues, topics with fan-out to subscriptions, dead-letter
//! sub-queues and time-bounded message locks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sqlx::SqlitePool;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Broker, Connector, Receiver, Sender};
use crate::db::{self, EntityRow};
use crate::error::{BrokerError, BrokerResult};
use crate::models::{
    EntityDescription, EntityKind, EntityRef, LockedMessage, MessageRecord, OutgoingMessage,
    RuntimeCounters, SequenceNumber, SubQueue,
};

/// Lock duration for newly created entities.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Clone)]
pub struct SqliteBroker {
    pool: SqlitePool,
}

impl SqliteBroker {
    /// Open the broker database at `url`, e.g. `sqlite://busdeck.db`.
    pub async fn open(url: &str, create_if_missing: bool) -> BrokerResult<Self> {
        let pool = db::open_pool(url, create_if_missing).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_queue(&self, name: &str) -> BrokerResult<()> {
        self.create_queue_with_lock(name, DEFAULT_LOCK_DURATION).await
    }

    pub async fn create_queue_with_lock(&self, name: &str, lock: Duration) -> BrokerResult<()> {
        self.create(&EntityRef::queue(name), None, lock).await
    }

    pub async fn create_topic(&self, name: &str) -> BrokerResult<()> {
        self.create(&EntityRef::topic(name), None, DEFAULT_LOCK_DURATION).await
    }

    pub async fn create_subscription(&self, topic: &str, name: &str) -> BrokerResult<()> {
        let parent = self.resolve(&EntityRef::topic(topic)).await?;
        self.create(
            &EntityRef::subscription(topic, name),
            Some(parent.id),
            DEFAULT_LOCK_DURATION,
        )
        .await
    }

    /// Delete an entity with everything it owns. Returns false if it did not exist.
    pub async fn delete_entity(&self, entity: &EntityRef) -> BrokerResult<bool> {
        Ok(db::delete_entity(&self.pool, &entity.path()).await? > 0)
    }

    /// Messages of `entity` currently held under an unexpired lock.
    pub async fn locked_count(&self, entity: &EntityRef) -> BrokerResult<i64> {
        let row = self.resolve(entity).await?;
        Ok(db::count_locked(&self.pool, row.id, db::now_ms()).await?)
    }

    async fn create(
        &self,
        entity: &EntityRef,
        topic_id: Option<i64>,
        lock: Duration,
    ) -> BrokerResult<()> {
        let path = entity.path();
        if db::get_entity(&self.pool, &path).await?.is_some() {
            return Err(BrokerError::EntityExists(path));
        }
        let name = match entity {
            EntityRef::Queue { name } | EntityRef::Topic { name } => name.as_str(),
            EntityRef::Subscription { subscription, .. } => subscription.as_str(),
        };
        db::insert_entity(
            &self.pool,
            &path,
            entity.kind().as_str(),
            name,
            topic_id,
            lock.as_millis() as i64,
        )
        .await?;
        tracing::info!(entity = %path, kind = entity.kind().as_str(), "created entity");
        Ok(())
    }

    async fn resolve(&self, entity: &EntityRef) -> BrokerResult<EntityRow> {
        let path = entity.path();
        match db::get_entity(&self.pool, &path).await? {
            Some(row) if row.kind == entity.kind().as_str() => Ok(row),
            _ => Err(BrokerError::EntityNotFound(path)),
        }
    }

    async fn list(
        &self,
        kind: EntityKind,
        topic_id: Option<i64>,
    ) -> BrokerResult<Vec<EntityDescription>> {
        let rows = db::list_entities(&self.pool, kind.as_str(), topic_id).await?;
        Ok(rows
            .into_iter()
            .map(|r| EntityDescription {
                name: r.name,
                status: r.status,
                created_at: db::from_millis(r.created_at),
            })
            .collect())
    }

    async fn subscription_ids(&self, topic_id: i64) -> BrokerResult<Vec<i64>> {
        let rows =
            db::list_entities(&self.pool, EntityKind::Subscription.as_str(), Some(topic_id))
                .await?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn list_queues(&self) -> BrokerResult<Vec<EntityDescription>> {
        self.list(EntityKind::Queue, None).await
    }

    async fn list_topics(&self) -> BrokerResult<Vec<EntityDescription>> {
        self.list(EntityKind::Topic, None).await
    }

    async fn list_subscriptions(&self, topic: &str) -> BrokerResult<Vec<EntityDescription>> {
        let parent = self.resolve(&EntityRef::topic(topic)).await?;
        self.list(EntityKind::Subscription, Some(parent.id)).await
    }

    async fn runtime_counters(&self, entity: &EntityRef) -> BrokerResult<RuntimeCounters> {
        let row = self.resolve(entity).await?;
        let ids = match entity.kind() {
            EntityKind::Topic => self.subscription_ids(row.id).await?,
            _ => vec![row.id],
        };
        let (active, dead_letter) = db::count_messages(&self.pool, &ids).await?;
        Ok(RuntimeCounters {
            total_message_count: active + dead_letter,
            dead_letter_count: dead_letter,
        })
    }

    async fn open_receiver(
        &self,
        entity: &EntityRef,
        sub_queue: SubQueue,
    ) -> BrokerResult<Box<dyn Receiver>> {
        if !entity.is_receivable() {
            return Err(BrokerError::Unsupported(format!("cannot receive from topic '{entity}'")));
        }
        let row = self.resolve(entity).await?;
        Ok(Box::new(SqliteReceiver {
            pool: self.pool.clone(),
            entity_id: row.id,
            sub_queue,
            lock_duration_ms: row.lock_duration_ms,
            closed: false,
        }))
    }

    async fn open_sender(&self, entity: &EntityRef) -> BrokerResult<Box<dyn Sender>> {
        if entity.kind() == EntityKind::Subscription {
            return Err(BrokerError::Unsupported(format!(
                "cannot send to subscription '{entity}', send to its topic"
            )));
        }
        let row = self.resolve(entity).await?;
        Ok(Box::new(SqliteSender {
            broker: self.clone(),
            entity_id: row.id,
            kind: entity.kind(),
            closed: false,
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

struct SqliteReceiver {
    pool: SqlitePool,
    entity_id: i64,
    sub_queue: SubQueue,
    lock_duration_ms: i64,
    closed: bool,
}

impl SqliteReceiver {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed { Err(BrokerError::Closed) } else { Ok(()) }
    }
}

#[async_trait]
impl Receiver for SqliteReceiver {
    async fn peek(&mut self, skip: u64, max: u32) -> BrokerResult<Vec<MessageRecord>> {
        self.ensure_open()?;
        let skip = i64::try_from(skip).unwrap_or(i64::MAX);
        db::peek_messages(&self.pool, self.entity_id, self.sub_queue, skip, i64::from(max))
            .await?
            .into_iter()
            .map(|row| row.into_record())
            .collect()
    }

    async fn receive(&mut self, max: u32, max_wait: Duration) -> BrokerResult<Vec<LockedMessage>> {
        self.ensure_open()?;
        let deadline = Instant::now() + max_wait;
        loop {
            let token = Uuid::new_v4().to_string();
            let now = db::now_ms();
            let until = now + self.lock_duration_ms;
            let rows = db::lock_batch(
                &self.pool,
                self.entity_id,
                self.sub_queue,
                i64::from(max),
                &token,
                now,
                until,
            )
            .await?;
            if !rows.is_empty() {
                return rows
                    .into_iter()
                    .map(|row| -> BrokerResult<LockedMessage> {
                        Ok(LockedMessage {
                            record: row.into_record()?,
                            lock_token: token.clone(),
                            locked_until: db::from_millis(until),
                        })
                    })
                    .collect();
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn complete(&mut self, message: &LockedMessage) -> BrokerResult<()> {
        self.ensure_open()?;
        let seq = message.sequence_number();
        let n = db::complete_message(&self.pool, seq, &message.lock_token, db::now_ms()).await?;
        lock_held(n, seq)
    }

    async fn abandon(&mut self, message: &LockedMessage) -> BrokerResult<()> {
        self.ensure_open()?;
        let seq = message.sequence_number();
        let n = db::release_lock(&self.pool, seq, &message.lock_token).await?;
        lock_held(n, seq)
    }

    async fn dead_letter(&mut self, message: &LockedMessage, reason: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        if self.sub_queue == SubQueue::DeadLetter {
            return Err(BrokerError::Unsupported("message is already dead-lettered".into()));
        }
        let seq = message.sequence_number();
        let n = db::dead_letter_message(&self.pool, seq, &message.lock_token, db::now_ms(), reason)
            .await?;
        lock_held(n, seq)
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.closed = true;
        Ok(())
    }
}

fn lock_held(rows_affected: u64, seq: SequenceNumber) -> BrokerResult<()> {
    if rows_affected == 0 { Err(BrokerError::LockLost(seq)) } else { Ok(()) }
}

struct SqliteSender {
    broker: SqliteBroker,
    entity_id: i64,
    kind: EntityKind,
    closed: bool,
}

#[async_trait]
impl Sender for SqliteSender {
    async fn send(&mut self, message: OutgoingMessage) -> BrokerResult<()> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let message_id = message
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let now = db::now_ms();
        match self.kind {
            EntityKind::Topic => {
                // One copy per subscription; a topic without subscriptions drops the message.
                let subs = self.broker.subscription_ids(self.entity_id).await?;
                let mut tx = self.broker.pool.begin().await?;
                for sub_id in subs {
                    db::insert_message(&mut *tx, sub_id, &message_id, &message, now).await?;
                }
                tx.commit().await?;
            }
            _ => {
                db::insert_message(&self.broker.pool, self.entity_id, &message_id, &message, now)
                    .await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Connects to local SQLite brokers; the credential is the database URL.
#[derive(Debug, Clone, Default)]
pub struct SqliteConnector;

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self, credential: &SecretString) -> BrokerResult<Arc<dyn Broker>> {
        let url = credential.expose_secret().trim();
        if !url.starts_with("sqlite:") {
            return Err(BrokerError::InvalidCredential(
                "expected a sqlite:// connection string".into(),
            ));
        }
        let broker = SqliteBroker::open(url, false).await?;
        Ok(Arc::new(broker))
    }
}
