//! Lock-then-match passes shared by delete and resubmit.
//!
//! Every received message is either settled (completed) or held under its
//! lock and abandoned when the pass or drain ends. Holding keeps failed and
//! unmatched messages from coming back at the head of the sub-queue.
//! Nothing stays locked past the pass that received it.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, warn};

use crate::broker::{Receiver, Sender};
use crate::config::EngineConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::models::{
    BatchOperationResult, EntityRef, LockedMessage, OutgoingMessage, SequenceNumber,
};

/// What to do with a received message that was selected.
pub(crate) enum Settle<'a> {
    Complete,
    /// Send a copy to the sender's entity, then complete the original.
    Resubmit { sender: &'a mut dyn Sender },
}

#[derive(Debug, Error)]
pub(crate) enum SettleError {
    #[error("send failed: {0}")]
    Send(BrokerError),
    #[error("complete failed: {0}")]
    Complete(BrokerError),
}

impl Settle<'_> {
    async fn apply(
        &mut self,
        receiver: &mut dyn Receiver,
        message: &LockedMessage,
    ) -> Result<(), SettleError> {
        if let Settle::Resubmit { sender } = self {
            // Never complete without a successful send first.
            sender
                .send(OutgoingMessage::resubmission_of(&message.record))
                .await
                .map_err(SettleError::Send)?;
        }
        receiver.complete(message).await.map_err(SettleError::Complete)
    }
}

/// Settle one message. A failed message is recorded and handed back, still locked.
async fn settle_one(
    receiver: &mut dyn Receiver,
    settle: &mut Settle<'_>,
    message: LockedMessage,
    result: &mut BatchOperationResult,
) -> Option<LockedMessage> {
    let seq = message.sequence_number();
    match settle.apply(receiver, &message).await {
        Ok(()) => {
            result.record_success(seq);
            None
        }
        Err(e) => {
            warn!(seq, error = %e, "settle failed, holding message until release");
            result.record_failure(seq, e.to_string());
            Some(message)
        }
    }
}

async fn abandon_quietly(receiver: &mut dyn Receiver, message: &LockedMessage) {
    if let Err(e) = receiver.abandon(message).await {
        warn!(seq = message.sequence_number(), error = %e, "abandon failed, lock will expire");
    }
}

async fn release_all(receiver: &mut dyn Receiver, held: Vec<LockedMessage>) {
    for message in &held {
        abandon_quietly(receiver, message).await;
    }
}

/// Settle exactly the `targets`, retrying whole receive passes up to
/// `max_attempts`. Targets never delivered end up in `not_found`.
pub(crate) async fn sweep_targets(
    receiver: &mut dyn Receiver,
    targets: &BTreeSet<SequenceNumber>,
    settle: &mut Settle<'_>,
    cfg: &EngineConfig,
    entity: &EntityRef,
) -> BrokerResult<BatchOperationResult> {
    let mut result = BatchOperationResult::with_requested(targets.len());
    let mut pending = targets.clone();
    let mut attempt = 0;

    while !pending.is_empty() && attempt < cfg.max_attempts {
        attempt += 1;
        let mut held = Vec::new();
        let pass = scan_pass(receiver, &mut pending, settle, &mut held, &mut result, cfg).await;
        debug!(
            entity = %entity,
            attempt,
            held = held.len(),
            pending = pending.len(),
            "receive pass finished"
        );
        release_all(receiver, held).await;

        if let Err(e) = pass {
            if result.processed() == 0 {
                return Err(e);
            }
            warn!(entity = %entity, attempt, error = %e, "receive failed, returning partial result");
            break;
        }
        if pending.is_empty() {
            break;
        }
        if attempt < cfg.max_attempts {
            tokio::time::sleep(cfg.retry_backoff).await;
        }
    }

    result.not_found = pending;
    Ok(result)
}

async fn scan_pass(
    receiver: &mut dyn Receiver,
    pending: &mut BTreeSet<SequenceNumber>,
    settle: &mut Settle<'_>,
    held: &mut Vec<LockedMessage>,
    result: &mut BatchOperationResult,
    cfg: &EngineConfig,
) -> BrokerResult<()> {
    let mut wait = cfg.receive_wait;
    loop {
        let batch = receiver.receive(cfg.selective_batch_size, wait).await?;
        // Later receives run with locks held; keep them short.
        wait = cfg.follow_up_wait;
        if batch.is_empty() {
            return Ok(());
        }
        for message in batch {
            if pending.remove(&message.sequence_number()) {
                if let Some(failed) = settle_one(receiver, settle, message, result).await {
                    held.push(failed);
                }
            } else {
                // Keep the lock so the next receive surfaces messages further back.
                held.push(message);
            }
        }
        if pending.is_empty() || held.len() >= cfg.max_held_locks {
            return Ok(());
        }
    }
}

/// Settle everything until the sub-queue returns an empty batch.
pub(crate) async fn drain(
    receiver: &mut dyn Receiver,
    settle: &mut Settle<'_>,
    cfg: &EngineConfig,
    entity: &EntityRef,
) -> BrokerResult<BatchOperationResult> {
    let mut result = BatchOperationResult::default();
    // Messages whose settle failed, held until the end.
    let mut held: Vec<LockedMessage> = Vec::new();
    let mut wait = cfg.receive_wait;

    loop {
        let received = receiver.receive(cfg.drain_batch_size, wait).await;
        wait = cfg.follow_up_wait;
        let batch = match received {
            Ok(batch) => batch,
            Err(e) if result.processed() == 0 => {
                release_all(receiver, held).await;
                return Err(e);
            }
            Err(e) => {
                warn!(entity = %entity, error = %e, "receive failed, returning partial result");
                break;
            }
        };
        if batch.is_empty() {
            break;
        }
        debug!(entity = %entity, received = batch.len(), "drain batch");

        let mut fresh = 0usize;
        for message in batch {
            let seq = message.sequence_number();
            if result.failed.contains_key(&seq) {
                // Held lock expired and the message came back under a new token.
                held.retain(|m| m.sequence_number() != seq);
                held.push(message);
                continue;
            }
            fresh += 1;
            if let Some(failed) = settle_one(receiver, settle, message, &mut result).await {
                held.push(failed);
            }
        }
        // Only expired held messages came back: nothing left to settle.
        if fresh == 0 {
            break;
        }
        if !cfg.drain_delay.is_zero() {
            tokio::time::sleep(cfg.drain_delay).await;
        }
    }

    release_all(receiver, held).await;
    result.requested_count = result.processed();
    Ok(result)
}
