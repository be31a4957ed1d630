//! Broker client adapter interface.
//!
//! The engine is written purely against these traits: `peek`, `receive`
//! under lock, `complete`, `abandon`, plus `send` and runtime counters. Any
//! broker offering those primitives can host it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::BrokerResult;
use crate::models::{
    EntityDescription, EntityRef, LockedMessage, MessageRecord, OutgoingMessage, RuntimeCounters,
    SubQueue,
};

pub mod sqlite;

/// An open broker session.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn list_queues(&self) -> BrokerResult<Vec<EntityDescription>>;
    async fn list_topics(&self) -> BrokerResult<Vec<EntityDescription>>;
    async fn list_subscriptions(&self, topic: &str) -> BrokerResult<Vec<EntityDescription>>;
    async fn runtime_counters(&self, entity: &EntityRef) -> BrokerResult<RuntimeCounters>;

    /// Open a receiver on one sub-queue of a queue or subscription.
    async fn open_receiver(
        &self,
        entity: &EntityRef,
        sub_queue: SubQueue,
    ) -> BrokerResult<Box<dyn Receiver>>;

    /// Open a sender on a queue or topic.
    async fn open_sender(&self, entity: &EntityRef) -> BrokerResult<Box<dyn Sender>>;

    async fn close(&self) -> BrokerResult<()>;
}

/// Receive link. Callers must `close` it on every exit path.
#[async_trait]
pub trait Receiver: Send {
    /// Non-destructive read starting `skip` messages into the sub-queue.
    async fn peek(&mut self, skip: u64, max: u32) -> BrokerResult<Vec<MessageRecord>>;

    /// Lock up to `max` messages, waiting at most `max_wait` for the first one.
    async fn receive(&mut self, max: u32, max_wait: Duration) -> BrokerResult<Vec<LockedMessage>>;

    /// Remove a locked message permanently.
    async fn complete(&mut self, message: &LockedMessage) -> BrokerResult<()>;

    /// Release the lock, returning the message to the sub-queue.
    async fn abandon(&mut self, message: &LockedMessage) -> BrokerResult<()>;

    /// Move a locked message to the dead-letter sub-queue.
    async fn dead_letter(&mut self, message: &LockedMessage, reason: &str) -> BrokerResult<()>;

    async fn close(&mut self) -> BrokerResult<()>;
}

/// Send link. Callers must `close` it on every exit path.
#[async_trait]
pub trait Sender: Send {
    async fn send(&mut self, message: OutgoingMessage) -> BrokerResult<()>;
    async fn close(&mut self) -> BrokerResult<()>;
}

/// Opens broker sessions from a credential.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credential: &SecretString) -> BrokerResult<Arc<dyn Broker>>;
}
