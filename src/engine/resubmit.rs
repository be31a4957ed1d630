use tracing::info;

use crate::broker::Broker;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::models::{BatchOperationResult, EntityRef, Selection, SubQueue};

use super::sweep::{self, Settle};
use super::{close_receiver, close_sender};

/// Copy dead-lettered messages back to the entity's main path.
///
/// Per message: send the copy, then complete the original. If either step
/// fails the original is abandoned and stays in the dead-letter sub-queue.
/// A send that succeeds followed by a failed complete leaves a duplicate
/// downstream; a message is never completed without a successful send.
pub async fn resubmit_messages(
    broker: &dyn Broker,
    entity: &EntityRef,
    selection: &Selection,
    cfg: &EngineConfig,
) -> Result<BatchOperationResult> {
    if !entity.is_receivable() {
        return Err(Error::invalid(format!("cannot resubmit messages of '{entity}'")));
    }
    if let Selection::Targets(targets) = selection {
        if targets.is_empty() {
            return Ok(BatchOperationResult::default());
        }
    }

    let target = entity.resubmit_target();
    let mut receiver = broker.open_receiver(entity, SubQueue::DeadLetter).await?;
    let mut sender = match broker.open_sender(&target).await {
        Ok(sender) => sender,
        Err(e) => {
            close_receiver(receiver.as_mut(), entity).await;
            return Err(e.into());
        }
    };

    let mut settle = Settle::Resubmit { sender: sender.as_mut() };
    let outcome = match selection {
        Selection::All => sweep::drain(receiver.as_mut(), &mut settle, cfg, entity).await,
        Selection::Targets(targets) => {
            sweep::sweep_targets(receiver.as_mut(), targets, &mut settle, cfg, entity).await
        }
    };
    close_receiver(receiver.as_mut(), entity).await;
    close_sender(sender.as_mut(), &target).await;
    let result = outcome?;

    info!(
        entity = %entity,
        target = %target,
        resubmitted = result.succeeded.len(),
        failed = result.failed.len(),
        not_found = result.not_found.len(),
        "resubmit finished"
    );
    Ok(result)
}
