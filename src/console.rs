use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Subcommand};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::broker::sqlite::SqliteConnector;
use crate::broker::{Broker, Connector};
use crate::config::EngineConfig;
use crate::engine;
use crate::error::{Error, Result};
use crate::models::{
    BatchOperationResult, EntityCounters, EntityRef, Inventory, MessagePage, Outcome, Selection,
    SequenceNumber, SubQueue,
};

/// Console-facing operations over one active broker session.
///
/// The credential is set by `connect` and only read afterwards; each
/// operation hands the session to the engine explicitly.
pub struct Console {
    connector: Arc<dyn Connector>,
    config: EngineConfig,
    session: RwLock<Option<Arc<dyn Broker>>>,
}

impl Console {
    pub fn new(connector: Arc<dyn Connector>, config: EngineConfig) -> Self {
        Self { connector, config, session: RwLock::new(None) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a session and validate it with one inventory listing.
    pub async fn connect(&self, credential: SecretString) -> Result<()> {
        let broker = self.connector.connect(&credential).await.map_err(Error::Connection)?;
        if let Err(e) = broker.list_queues().await {
            if let Err(close_err) = broker.close().await {
                warn!(error = %close_err, "failed to close rejected session");
            }
            return Err(Error::Connection(e));
        }
        // In-flight requests keep their own handle on a replaced session.
        *self.session.write().await = Some(broker);
        info!("connected to broker");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    async fn broker(&self) -> Result<Arc<dyn Broker>> {
        self.session.read().await.clone().ok_or(Error::NotConnected)
    }

    pub async fn list_entities(&self) -> Result<Inventory> {
        let broker = self.broker().await?;
        engine::collect_inventory(broker.as_ref()).await
    }

    pub async fn peek_messages(
        &self,
        entity: &EntityRef,
        sub_queue: SubQueue,
        page: u32,
    ) -> Result<MessagePage> {
        let broker = self.broker().await?;
        engine::peek_page(broker.as_ref(), entity, sub_queue, page, &self.config).await
    }

    pub async fn entity_details(&self, entity: &EntityRef) -> Result<EntityCounters> {
        let broker = self.broker().await?;
        engine::entity_details(broker.as_ref(), entity).await
    }

    pub async fn delete_messages(
        &self,
        entity: &EntityRef,
        sub_queue: SubQueue,
        selection: &Selection,
    ) -> Result<BatchOperationResult> {
        let broker = self.broker().await?;
        engine::delete_messages(broker.as_ref(), entity, sub_queue, selection, &self.config).await
    }

    pub async fn resubmit_messages(
        &self,
        entity: &EntityRef,
        selection: &Selection,
    ) -> Result<BatchOperationResult> {
        let broker = self.broker().await?;
        engine::resubmit_messages(broker.as_ref(), entity, selection, &self.config).await
    }
}

/// Build a selection from an explicit target list or the all flag, exactly one of them.
pub fn selection_from(targets: Option<Vec<SequenceNumber>>, all: bool) -> Result<Selection> {
    let targets = targets.unwrap_or_default();
    match (targets.is_empty(), all) {
        (true, true) => Ok(Selection::All),
        (false, false) => Ok(Selection::Targets(targets.into_iter().collect::<BTreeSet<_>>())),
        (false, true) => Err(Error::invalid("pass either sequence numbers or all, not both")),
        (true, false) => Err(Error::invalid("no sequence numbers given and all not set")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessage {
    pub id: SequenceNumber,
    pub reason: String,
}

fn failed_list(result: &BatchOperationResult) -> Vec<FailedMessage> {
    result
        .failed
        .iter()
        .map(|(id, reason)| FailedMessage { id: *id, reason: reason.clone() })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSummary {
    pub deleted_count: usize,
    pub failed_count: usize,
    pub deleted: Vec<SequenceNumber>,
    pub failed: Vec<FailedMessage>,
    pub not_found: Vec<SequenceNumber>,
    pub outcome: Outcome,
}

impl From<&BatchOperationResult> for DeleteSummary {
    fn from(r: &BatchOperationResult) -> Self {
        Self {
            deleted_count: r.succeeded.len(),
            failed_count: r.failed.len(),
            deleted: r.succeeded.iter().copied().collect(),
            failed: failed_list(r),
            not_found: r.not_found.iter().copied().collect(),
            outcome: r.outcome(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResubmitSummary {
    pub succeeded: Vec<SequenceNumber>,
    pub failed: Vec<FailedMessage>,
    pub not_found: Vec<SequenceNumber>,
    pub outcome: Outcome,
}

impl From<&BatchOperationResult> for ResubmitSummary {
    fn from(r: &BatchOperationResult) -> Self {
        Self {
            succeeded: r.succeeded.iter().copied().collect(),
            failed: failed_list(r),
            not_found: r.not_found.iter().copied().collect(),
            outcome: r.outcome(),
        }
    }
}

/// Broker connection shared by the one-shot console commands
#[derive(Args, Debug)]
pub struct ConnectionArgs {
    /// Connection string, e.g. sqlite://busdeck.db
    #[arg(short, long)]
    pub connection: String,
}

pub fn parse_entity(s: &str) -> std::result::Result<EntityRef, String> {
    EntityRef::parse_path(s)
        .ok_or_else(|| format!("'{s}' is not a queue name or topic/subscriptions/name path"))
}

/// One-shot console commands
#[derive(Subcommand, Debug)]
pub enum ConsoleCommands {
    /// List queues, topics and subscriptions with message counts
    Entities {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    /// Show fresh counters for one entity
    Details {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Queue name or topic/subscriptions/name
        #[arg(value_parser = parse_entity)]
        entity: EntityRef,
    },
    /// Peek one page of messages without locking them
    Peek {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(value_parser = parse_entity)]
        entity: EntityRef,
        /// Zero-based page index
        #[arg(long, default_value_t = 0)]
        page: u32,
        /// Read the dead-letter sub-queue
        #[arg(long)]
        dead_letter: bool,
    },
    /// Delete messages by sequence number, or all of them
    Delete {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(value_parser = parse_entity)]
        entity: EntityRef,
        /// Comma-separated sequence numbers, e.g. 1,2,3
        #[arg(long, value_delimiter = ',')]
        seq: Vec<SequenceNumber>,
        /// Delete every message in the sub-queue
        #[arg(long)]
        all: bool,
        /// Target the dead-letter sub-queue
        #[arg(long)]
        dead_letter: bool,
    },
    /// Resubmit dead-lettered messages to the entity's main path
    Resubmit {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(value_parser = parse_entity)]
        entity: EntityRef,
        /// Comma-separated sequence numbers, e.g. 1,2,3
        #[arg(long, value_delimiter = ',')]
        seq: Vec<SequenceNumber>,
        /// Resubmit every dead-lettered message
        #[arg(long)]
        all: bool,
    },
}

async fn open(conn: &ConnectionArgs) -> anyhow::Result<Arc<dyn Broker>> {
    let credential = SecretString::from(conn.connection.clone());
    let broker = SqliteConnector
        .connect(&credential)
        .await
        .context("Failed to connect to broker")?;
    Ok(broker)
}

/// Execute a console command
pub async fn run_console_command(cmd: ConsoleCommands) -> anyhow::Result<()> {
    let cfg = EngineConfig::from_env()?;

    match cmd {
        ConsoleCommands::Entities { conn } => {
            let broker = open(&conn).await?;
            let inventory = engine::collect_inventory(broker.as_ref())
                .await
                .context("Error listing entities")?;
            println!("{:<40} {:>8} {:>8} {:>8}", "ENTITY", "TOTAL", "ACTIVE", "DLQ");
            for q in &inventory.queues {
                print_counters(&q.name, &q.counters);
            }
            for t in &inventory.topics {
                print_counters(&format!("{} (topic)", t.name), &t.counters);
                for s in &t.subscriptions {
                    print_counters(
                        &format!("  {}/subscriptions/{}", s.topic_name, s.subscription_name),
                        &s.counters,
                    );
                }
            }
            broker.close().await?;
        }
        ConsoleCommands::Details { conn, entity } => {
            let broker = open(&conn).await?;
            let counters = engine::entity_details(broker.as_ref(), &entity)
                .await
                .context("Error fetching entity details")?;
            println!("{}", serde_json::to_string_pretty(&counters)?);
            broker.close().await?;
        }
        ConsoleCommands::Peek { conn, entity, page, dead_letter } => {
            let broker = open(&conn).await?;
            let sub_queue = SubQueue::from_dlq_flag(dead_letter);
            let p = engine::peek_page(broker.as_ref(), &entity, sub_queue, page, &cfg)
                .await
                .context("Error peeking messages")?;
            if p.messages.is_empty() {
                println!("No messages on page {} of '{}'", p.current_page, entity);
            }
            for m in &p.messages {
                println!(
                    "[seq={}] id={} enqueued={} deliveries={} body={}",
                    m.sequence_number, m.message_id, m.enqueued_time, m.delivery_count, m.body
                );
            }
            println!(
                "page {}/{} ({} messages, more: {})",
                p.current_page + 1,
                p.total_pages,
                p.total_messages,
                p.has_more
            );
            broker.close().await?;
        }
        ConsoleCommands::Delete { conn, entity, seq, all, dead_letter } => {
            let selection = selection_from(Some(seq), all)?;
            let broker = open(&conn).await?;
            let sub_queue = SubQueue::from_dlq_flag(dead_letter);
            let result =
                engine::delete_messages(broker.as_ref(), &entity, sub_queue, &selection, &cfg)
                    .await
                    .context("Error deleting messages")?;
            println!("{}", serde_json::to_string_pretty(&DeleteSummary::from(&result))?);
            broker.close().await?;
        }
        ConsoleCommands::Resubmit { conn, entity, seq, all } => {
            let selection = selection_from(Some(seq), all)?;
            let broker = open(&conn).await?;
            let result = engine::resubmit_messages(broker.as_ref(), &entity, &selection, &cfg)
                .await
                .context("Error resubmitting messages")?;
            println!("{}", serde_json::to_string_pretty(&ResubmitSummary::from(&result))?);
            broker.close().await?;
        }
    }
    Ok(())
}

fn print_counters(label: &str, c: &EntityCounters) {
    println!(
        "{:<40} {:>8} {:>8} {:>8}",
        label, c.total_message_count, c.active_message_count, c.dead_letter_count
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_requires_exactly_one_mode() {
        assert_eq!(selection_from(None, true).unwrap(), Selection::All);
        assert_eq!(
            selection_from(Some(vec![3, 1, 3]), false).unwrap(),
            Selection::Targets([1, 3].into_iter().collect())
        );
        assert!(matches!(selection_from(Some(vec![1]), true), Err(Error::InvalidRequest(_))));
        assert!(matches!(selection_from(Some(vec![]), false), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn delete_summary_counts() {
        let mut r = BatchOperationResult::with_requested(3);
        r.record_success(1);
        r.record_failure(2, "lock lost");
        r.not_found.insert(3);
        let s = DeleteSummary::from(&r);
        assert_eq!(s.deleted_count, 1);
        assert_eq!(s.failed_count, 1);
        assert_eq!(s.not_found, vec![3]);
        assert_eq!(s.outcome, Outcome::Partial);
    }
}
