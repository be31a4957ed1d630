use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use serde_json::{Map, Value};
use tracing::warn;

use crate::broker::sqlite::SqliteBroker;
use crate::broker::Broker;
use crate::console::{ConnectionArgs, parse_entity};
use crate::models::{EntityRef, OutgoingMessage, SubQueue};

/// Administration of the local SQLite broker
#[derive(Subcommand, Debug)]
pub enum LocalCommands {
    /// Create the broker database if it does not exist
    Init {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    /// Add a queue
    CreateQueue {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Queue name
        name: String,
        /// Message lock duration in milliseconds
        #[arg(long, default_value_t = 30_000)]
        lock_ms: u64,
    },
    /// Add a topic
    CreateTopic {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Topic name
        name: String,
    },
    /// Add a subscription to a topic
    CreateSubscription {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Topic name
        topic: String,
        /// Subscription name
        name: String,
    },
    /// Remove a queue, topic or subscription with all its messages
    Remove {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Queue or topic name, or topic/subscriptions/name
        path: String,
        /// Treat the name as a topic
        #[arg(long)]
        topic: bool,
    },
    /// Send JSON message(s). Use --body or --file (NDJSON or JSON array).
    Send {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Queue name, or topic name with --topic
        name: String,
        /// Send to a topic instead of a queue
        #[arg(long)]
        topic: bool,
        /// Inline JSON body (e.g. '{"k":"v"}')
        #[arg(long)]
        body: Option<String>,
        /// Read bodies from file (NDJSON or JSON array)
        #[arg(long)]
        file: Option<PathBuf>,
        /// Message id (generated when absent)
        #[arg(long)]
        message_id: Option<String>,
        #[arg(long)]
        correlation_id: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        content_type: Option<String>,
        /// Application property, key=value; repeatable
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },
    /// Receive up to N active messages and move them to the dead-letter sub-queue
    DeadLetter {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(value_parser = parse_entity)]
        entity: EntityRef,
        /// Number of messages to dead-letter
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Dead-letter reason
        #[arg(long, default_value = "manual")]
        reason: String,
    },
}

fn parse_property(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

/// Read message bodies from a JSON array file, or NDJSON otherwise
fn read_bodies(path: &PathBuf) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    if let Ok(arr) = serde_json::from_str::<Vec<Value>>(&content) {
        return Ok(arr);
    }
    let mut items = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let val: Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON at line {}", i + 1))?;
        items.push(val);
    }
    Ok(items)
}

/// Execute a local broker command
pub async fn run_local_command(cmd: LocalCommands) -> Result<()> {
    match cmd {
        LocalCommands::Init { conn } => {
            let broker = SqliteBroker::open(&conn.connection, true)
                .await
                .context("Error creating broker database")?;
            println!("Initialized broker at '{}'", conn.connection);
            broker.close().await?;
        }
        LocalCommands::CreateQueue { conn, name, lock_ms } => {
            let broker = open(&conn).await?;
            broker
                .create_queue_with_lock(&name, Duration::from_millis(lock_ms))
                .await
                .context("Error creating queue")?;
            println!("Created queue '{}'", name);
        }
        LocalCommands::CreateTopic { conn, name } => {
            let broker = open(&conn).await?;
            broker.create_topic(&name).await.context("Error creating topic")?;
            println!("Created topic '{}'", name);
        }
        LocalCommands::CreateSubscription { conn, topic, name } => {
            let broker = open(&conn).await?;
            broker
                .create_subscription(&topic, &name)
                .await
                .context("Error creating subscription")?;
            println!("Created subscription '{}/subscriptions/{}'", topic, name);
        }
        LocalCommands::Remove { conn, path, topic } => {
            let entity = if topic {
                EntityRef::topic(path)
            } else {
                parse_entity(&path).map_err(anyhow::Error::msg)?
            };
            let broker = open(&conn).await?;
            if broker.delete_entity(&entity).await? {
                println!("Removed '{}'", entity);
            } else {
                bail!("'{}' not found", entity);
            }
        }
        LocalCommands::Send {
            conn,
            name,
            topic,
            body,
            file,
            message_id,
            correlation_id,
            subject,
            content_type,
            properties,
        } => {
            let mut bodies = Vec::new();
            if let Some(path) = &file {
                bodies.extend(read_bodies(path)?);
            }
            if let Some(raw) = body {
                bodies.push(serde_json::from_str(&raw).context("Invalid JSON body")?);
            }
            if bodies.is_empty() {
                bail!("Provide --body or --file");
            }
            if message_id.is_some() && bodies.len() > 1 {
                bail!("--message-id only applies to a single message");
            }

            let props: Map<String, Value> =
                properties.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            let entity = if topic { EntityRef::topic(&name) } else { EntityRef::queue(&name) };
            let broker = open(&conn).await?;
            let mut sender = broker.open_sender(&entity).await?;
            let count = bodies.len();
            let mut outcome = Ok(());
            for body in bodies {
                let msg = OutgoingMessage {
                    message_id: message_id.clone(),
                    body,
                    properties: props.clone(),
                    correlation_id: correlation_id.clone(),
                    content_type: content_type.clone(),
                    subject: subject.clone(),
                };
                if let Err(e) = sender.send(msg).await {
                    outcome = Err(e);
                    break;
                }
            }
            sender.close().await?;
            outcome.context("Error sending message")?;
            println!("Sent {} message(s) to '{}'", count, entity);
        }
        LocalCommands::DeadLetter { conn, entity, count, reason } => {
            let broker = open(&conn).await?;
            let mut receiver = broker.open_receiver(&entity, SubQueue::Active).await?;
            let mut moved = 0usize;
            let mut outcome = Ok(());
            match receiver.receive(count, Duration::from_secs(1)).await {
                Ok(batch) => {
                    for m in &batch {
                        if let Err(e) = receiver.dead_letter(m, &reason).await {
                            outcome = Err(e);
                            break;
                        }
                        moved += 1;
                    }
                    for m in batch.iter().skip(moved) {
                        if let Err(e) = receiver.abandon(m).await {
                            let seq = m.sequence_number();
                            warn!(seq, error = %e, "abandon failed, lock will expire");
                        }
                    }
                }
                Err(e) => outcome = Err(e),
            }
            receiver.close().await?;
            outcome.context("Error dead-lettering messages")?;
            println!("Dead-lettered {} message(s) from '{}'", moved, entity);
        }
    }
    Ok(())
}

async fn open(conn: &ConnectionArgs) -> Result<SqliteBroker> {
    SqliteBroker::open(&conn.connection, false)
        .await
        .context("Failed to open broker database")
}
