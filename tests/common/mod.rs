#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use busdeck::broker::sqlite::SqliteBroker;
use busdeck::broker::{Broker, Receiver, Sender};
use busdeck::config::EngineConfig;
use busdeck::error::{BrokerError, BrokerResult};
use busdeck::models::{
    EntityDescription, EntityRef, LockedMessage, MessageRecord, OutgoingMessage, RuntimeCounters,
    SequenceNumber, SubQueue,
};
use serde_json::json;

/// Engine config with short waits so tests do not sit on empty receives.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        receive_wait: Duration::from_millis(50),
        retry_backoff: Duration::from_millis(10),
        follow_up_wait: Duration::ZERO,
        drain_delay: Duration::ZERO,
        ..EngineConfig::default()
    }
}

pub fn db_url(tmp: &tempfile::TempDir) -> String {
    format!("sqlite://{}", tmp.path().join("broker.db").display())
}

pub async fn temp_broker(tmp: &tempfile::TempDir) -> anyhow::Result<SqliteBroker> {
    Ok(SqliteBroker::open(&db_url(tmp), true).await?)
}

/// Send `n` messages with ids `{prefix}{i}` and bodies `{"n": i}`.
pub async fn send_messages(
    broker: &SqliteBroker,
    entity: &EntityRef,
    prefix: &str,
    n: usize,
) -> anyhow::Result<()> {
    let mut sender = broker.open_sender(entity).await?;
    for i in 0..n {
        sender
            .send(OutgoingMessage {
                message_id: Some(format!("{prefix}{i}")),
                body: json!({ "n": i }),
                properties: [("source".to_string(), json!("test"))].into_iter().collect(),
                correlation_id: Some(format!("corr-{i}")),
                content_type: Some("application/json".into()),
                subject: Some("order.created".into()),
            })
            .await?;
    }
    sender.close().await?;
    Ok(())
}

/// All records of one sub-queue, in broker order.
pub async fn peek_all(
    broker: &SqliteBroker,
    entity: &EntityRef,
    sub_queue: SubQueue,
) -> anyhow::Result<Vec<MessageRecord>> {
    let mut receiver = broker.open_receiver(entity, sub_queue).await?;
    let records = receiver.peek(0, 100_000).await?;
    receiver.close().await?;
    Ok(records)
}

pub async fn seq_of(
    broker: &SqliteBroker,
    entity: &EntityRef,
    sub_queue: SubQueue,
    message_id: &str,
) -> anyhow::Result<SequenceNumber> {
    peek_all(broker, entity, sub_queue)
        .await?
        .into_iter()
        .find(|m| m.message_id == message_id)
        .map(|m| m.sequence_number)
        .ok_or_else(|| anyhow::anyhow!("message {message_id} not found"))
}

/// Move every active message of `entity` to its dead-letter sub-queue.
pub async fn dead_letter_all(broker: &SqliteBroker, entity: &EntityRef) -> anyhow::Result<()> {
    let mut receiver = broker.open_receiver(entity, SubQueue::Active).await?;
    loop {
        let batch = receiver.receive(100, Duration::ZERO).await?;
        if batch.is_empty() {
            break;
        }
        for m in &batch {
            receiver.dead_letter(m, "test").await?;
        }
    }
    receiver.close().await?;
    Ok(())
}

pub async fn counters(broker: &SqliteBroker, entity: &EntityRef) -> anyhow::Result<RuntimeCounters> {
    Ok(broker.runtime_counters(entity).await?)
}

/// Failures to inject into an otherwise healthy broker.
#[derive(Debug, Default)]
pub struct Faults {
    /// Completing these sequence numbers fails.
    pub fail_complete: HashSet<SequenceNumber>,
    /// Every send fails.
    pub fail_send: bool,
    /// Counter reads for these entity paths fail.
    pub fail_counters: HashSet<String>,
    /// Receives never hand out these sequence numbers.
    pub hidden: HashSet<SequenceNumber>,
    /// Each receiver fails every receive after this many successful ones.
    pub fail_receive_after: Option<usize>,
}

pub struct FaultyBroker {
    pub inner: SqliteBroker,
    pub faults: Arc<Faults>,
}

impl FaultyBroker {
    pub fn new(inner: SqliteBroker, faults: Faults) -> Self {
        Self { inner, faults: Arc::new(faults) }
    }
}

fn injected(what: &str) -> BrokerError {
    BrokerError::Other(format!("injected {what} failure"))
}

#[async_trait]
impl Broker for FaultyBroker {
    async fn list_queues(&self) -> BrokerResult<Vec<EntityDescription>> {
        self.inner.list_queues().await
    }

    async fn list_topics(&self) -> BrokerResult<Vec<EntityDescription>> {
        self.inner.list_topics().await
    }

    async fn list_subscriptions(&self, topic: &str) -> BrokerResult<Vec<EntityDescription>> {
        self.inner.list_subscriptions(topic).await
    }

    async fn runtime_counters(&self, entity: &EntityRef) -> BrokerResult<RuntimeCounters> {
        if self.faults.fail_counters.contains(&entity.path()) {
            return Err(injected("counter"));
        }
        self.inner.runtime_counters(entity).await
    }

    async fn open_receiver(
        &self,
        entity: &EntityRef,
        sub_queue: SubQueue,
    ) -> BrokerResult<Box<dyn Receiver>> {
        let inner = self.inner.open_receiver(entity, sub_queue).await?;
        Ok(Box::new(FaultyReceiver { inner, faults: self.faults.clone(), receives: 0 }))
    }

    async fn open_sender(&self, entity: &EntityRef) -> BrokerResult<Box<dyn Sender>> {
        let inner = self.inner.open_sender(entity).await?;
        Ok(Box::new(FaultySender { inner, faults: self.faults.clone() }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close().await
    }
}

struct FaultyReceiver {
    inner: Box<dyn Receiver>,
    faults: Arc<Faults>,
    receives: usize,
}

#[async_trait]
impl Receiver for FaultyReceiver {
    async fn peek(&mut self, skip: u64, max: u32) -> BrokerResult<Vec<MessageRecord>> {
        self.inner.peek(skip, max).await
    }

    async fn receive(&mut self, max: u32, max_wait: Duration) -> BrokerResult<Vec<LockedMessage>> {
        if self.faults.fail_receive_after.is_some_and(|n| self.receives >= n) {
            return Err(injected("receive"));
        }
        self.receives += 1;
        let batch = self.inner.receive(max, max_wait).await?;
        let mut visible = Vec::with_capacity(batch.len());
        for m in batch {
            if self.faults.hidden.contains(&m.sequence_number()) {
                self.inner.abandon(&m).await?;
            } else {
                visible.push(m);
            }
        }
        Ok(visible)
    }

    async fn complete(&mut self, message: &LockedMessage) -> BrokerResult<()> {
        if self.faults.fail_complete.contains(&message.sequence_number()) {
            return Err(injected("complete"));
        }
        self.inner.complete(message).await
    }

    async fn abandon(&mut self, message: &LockedMessage) -> BrokerResult<()> {
        self.inner.abandon(message).await
    }

    async fn dead_letter(&mut self, message: &LockedMessage, reason: &str) -> BrokerResult<()> {
        self.inner.dead_letter(message, reason).await
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.inner.close().await
    }
}

struct FaultySender {
    inner: Box<dyn Sender>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Sender for FaultySender {
    async fn send(&mut self, message: OutgoingMessage) -> BrokerResult<()> {
        if self.faults.fail_send {
            return Err(injected("send"));
        }
        self.inner.send(message).await
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.inner.close().await
    }
}
