use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broker-assigned, per-entity unique identifier used for all targeting.
pub type SequenceNumber = i64;

/// Which side of an entity a read or receive goes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubQueue {
    #[default]
    Active,
    DeadLetter,
}

impl SubQueue {
    pub fn from_dlq_flag(is_dlq: bool) -> Self {
        if is_dlq { SubQueue::DeadLetter } else { SubQueue::Active }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubQueue::Active => "active",
            SubQueue::DeadLetter => "deadletter",
        }
    }
}

/// Address of a broker entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Queue { name: String },
    Topic { name: String },
    Subscription { topic: String, subscription: String },
}

impl EntityRef {
    pub fn queue(name: impl Into<String>) -> Self {
        EntityRef::Queue { name: name.into() }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        EntityRef::Topic { name: name.into() }
    }

    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        EntityRef::Subscription { topic: topic.into(), subscription: subscription.into() }
    }

    /// Parse `orders` as a queue and `events/subscriptions/audit` as a subscription.
    pub fn parse_path(path: &str) -> Option<Self> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return None;
        }
        match path.split('/').collect::<Vec<_>>().as_slice() {
            [name] => Some(EntityRef::queue(*name)),
            [topic, marker, sub]
                if marker.eq_ignore_ascii_case("subscriptions")
                    && !topic.is_empty()
                    && !sub.is_empty() =>
            {
                Some(EntityRef::subscription(*topic, *sub))
            }
            _ => None,
        }
    }

    /// Broker path, unique across all entity kinds.
    pub fn path(&self) -> String {
        match self {
            EntityRef::Queue { name } | EntityRef::Topic { name } => name.clone(),
            EntityRef::Subscription { topic, subscription } => {
                format!("{topic}/subscriptions/{subscription}")
            }
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Queue { .. } => EntityKind::Queue,
            EntityRef::Topic { .. } => EntityKind::Topic,
            EntityRef::Subscription { .. } => EntityKind::Subscription,
        }
    }

    /// Entity that receives resubmitted messages: a queue feeds itself, a
    /// subscription is fed through its topic.
    pub fn resubmit_target(&self) -> EntityRef {
        match self {
            EntityRef::Subscription { topic, .. } => EntityRef::topic(topic.clone()),
            other => other.clone(),
        }
    }

    /// Only queues and subscriptions hold messages that can be read.
    pub fn is_receivable(&self) -> bool {
        !matches!(self, EntityRef::Topic { .. })
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Queue,
    Topic,
    Subscription,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Queue => "queue",
            EntityKind::Topic => "topic",
            EntityKind::Subscription => "subscription",
        }
    }
}

/// Static description of an entity as listed by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescription {
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Counters exactly as the broker reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCounters {
    pub total_message_count: i64,
    pub dead_letter_count: i64,
}

/// Counters attached to every entity in the inventory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCounters {
    pub total_message_count: i64,
    pub active_message_count: i64,
    pub dead_letter_count: i64,
}

impl EntityCounters {
    pub fn zeroed() -> Self {
        Self::default()
    }
}

impl From<RuntimeCounters> for EntityCounters {
    fn from(rt: RuntimeCounters) -> Self {
        // Snapshots can be inconsistent (dead-letter above total), clamp at zero.
        Self {
            total_message_count: rt.total_message_count,
            active_message_count: (rt.total_message_count - rt.dead_letter_count).max(0),
            dead_letter_count: rt.dead_letter_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntity {
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: EntityCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEntity {
    pub topic_name: String,
    pub subscription_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: EntityCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicEntity {
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: EntityCounters,
    pub subscriptions: Vec<SubscriptionEntity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    pub queues: Vec<QueueEntity>,
    pub topics: Vec<TopicEntity>,
}

/// A message as seen by peek. Never persisted by the console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: String,
    pub sequence_number: SequenceNumber,
    pub body: Value,
    pub properties: Map<String, Value>,
    pub enqueued_time: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub delivery_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_reason: Option<String>,
}

/// A message received under an exclusive lock. Must be completed or abandoned.
#[derive(Debug, Clone)]
pub struct LockedMessage {
    pub record: MessageRecord,
    pub lock_token: String,
    pub locked_until: DateTime<Utc>,
}

impl LockedMessage {
    pub fn sequence_number(&self) -> SequenceNumber {
        self.record.sequence_number
    }
}

/// Message handed to a sender.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub message_id: Option<String>,
    pub body: Value,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
}

impl OutgoingMessage {
    /// Copy of a dead-lettered message for resubmission, traceable to its origin.
    pub fn resubmission_of(record: &MessageRecord) -> Self {
        Self {
            message_id: Some(format!("resubmit-{}", record.message_id)),
            body: record.body.clone(),
            properties: record.properties.clone(),
            correlation_id: record.correlation_id.clone(),
            content_type: record.content_type.clone(),
            subject: record.subject.clone(),
        }
    }
}

/// One page of peeked messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<MessageRecord>,
    pub total_messages: i64,
    pub current_page: u32,
    pub total_pages: u32,
    pub has_more: bool,
}

/// `max(1, ceil(total / page_size))`.
pub fn total_pages(total_messages: i64, page_size: u32) -> u32 {
    let page_size = i64::from(page_size.max(1));
    let total = total_messages.max(0);
    let pages = (total + page_size - 1) / page_size;
    pages.max(1).min(i64::from(u32::MAX)) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
}

/// Aggregate of a delete or resubmit run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationResult {
    pub requested_count: usize,
    pub succeeded: BTreeSet<SequenceNumber>,
    pub failed: BTreeMap<SequenceNumber, String>,
    /// Targets never delivered within the attempt bound.
    pub not_found: BTreeSet<SequenceNumber>,
}

impl BatchOperationResult {
    pub fn with_requested(requested_count: usize) -> Self {
        Self { requested_count, ..Self::default() }
    }

    pub fn record_success(&mut self, seq: SequenceNumber) {
        self.failed.remove(&seq);
        self.succeeded.insert(seq);
    }

    pub fn record_failure(&mut self, seq: SequenceNumber, reason: impl Into<String>) {
        if !self.succeeded.contains(&seq) {
            self.failed.insert(seq, reason.into());
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn outcome(&self) -> Outcome {
        let missing = !self.failed.is_empty() || !self.not_found.is_empty();
        match (self.succeeded.is_empty(), missing) {
            (_, false) => Outcome::Success,
            (false, true) => Outcome::Partial,
            (true, true) => Outcome::Failed,
        }
    }
}

/// Selection for a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Targets(BTreeSet<SequenceNumber>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_count_is_clamped() {
        let c = EntityCounters::from(RuntimeCounters {
            total_message_count: 3,
            dead_letter_count: 7,
        });
        assert_eq!(c.active_message_count, 0);
        let c = EntityCounters::from(RuntimeCounters {
            total_message_count: 10,
            dead_letter_count: 4,
        });
        assert_eq!(c.active_message_count, 6);
    }

    #[test]
    fn page_count_never_below_one() {
        assert_eq!(total_pages(0, 100), 1);
        assert_eq!(total_pages(100, 100), 1);
        assert_eq!(total_pages(101, 100), 2);
        assert_eq!(total_pages(250, 100), 3);
        assert_eq!(total_pages(-5, 100), 1);
    }

    #[test]
    fn parses_entity_paths() {
        assert_eq!(EntityRef::parse_path("orders"), Some(EntityRef::queue("orders")));
        assert_eq!(
            EntityRef::parse_path("events/Subscriptions/audit"),
            Some(EntityRef::subscription("events", "audit"))
        );
        assert_eq!(EntityRef::parse_path("events/audit"), None);
        assert_eq!(EntityRef::parse_path(""), None);
        let sub = EntityRef::subscription("events", "audit");
        assert_eq!(sub.path(), "events/subscriptions/audit");
        assert_eq!(sub.resubmit_target(), EntityRef::topic("events"));
    }

    #[test]
    fn outcome_distinguishes_partial_results() {
        let mut r = BatchOperationResult::with_requested(2);
        assert_eq!(r.outcome(), Outcome::Success);
        r.not_found.insert(2);
        assert_eq!(r.outcome(), Outcome::Failed);
        r.record_success(1);
        assert_eq!(r.outcome(), Outcome::Partial);
    }

    #[test]
    fn success_supersedes_failure() {
        let mut r = BatchOperationResult::with_requested(1);
        r.record_failure(5, "lock lost");
        r.record_success(5);
        assert!(r.failed.is_empty());
        r.record_failure(5, "late");
        assert!(r.failed.is_empty());
        assert_eq!(r.processed(), 1);
    }

    #[test]
    fn resubmission_derives_message_id() {
        let record = MessageRecord {
            message_id: "m7".into(),
            sequence_number: 7,
            body: serde_json::json!({"k": "v"}),
            properties: Map::new(),
            enqueued_time: Utc::now(),
            correlation_id: Some("c".into()),
            content_type: Some("application/json".into()),
            subject: None,
            delivery_count: 1,
            dead_letter_reason: Some("poison".into()),
        };
        let out = OutgoingMessage::resubmission_of(&record);
        assert_eq!(out.message_id.as_deref(), Some("resubmit-m7"));
        assert_eq!(out.correlation_id.as_deref(), Some("c"));
        assert_eq!(out.body, record.body);
    }
}
