use tracing::info;

use crate::broker::Broker;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::models::{BatchOperationResult, EntityRef, Selection, SubQueue};

use super::close_receiver;
use super::sweep::{self, Settle};

/// Delete a set of messages, or everything, from one sub-queue.
///
/// There is no delete-by-id on a lock-based broker: messages are received
/// under lock, targets are completed and everything else is abandoned.
/// Targets still unseen after `max_attempts` passes are reported in
/// `not_found`, distinct from targets whose completion failed.
pub async fn delete_messages(
    broker: &dyn Broker,
    entity: &EntityRef,
    sub_queue: SubQueue,
    selection: &Selection,
    cfg: &EngineConfig,
) -> Result<BatchOperationResult> {
    if !entity.is_receivable() {
        return Err(Error::invalid(format!("cannot delete messages from '{entity}'")));
    }
    if let Selection::Targets(targets) = selection {
        if targets.is_empty() {
            return Ok(BatchOperationResult::default());
        }
    }

    let mut receiver = broker.open_receiver(entity, sub_queue).await?;
    let mut settle = Settle::Complete;
    let outcome = match selection {
        Selection::All => sweep::drain(receiver.as_mut(), &mut settle, cfg, entity).await,
        Selection::Targets(targets) => {
            sweep::sweep_targets(receiver.as_mut(), targets, &mut settle, cfg, entity).await
        }
    };
    close_receiver(receiver.as_mut(), entity).await;
    let result = outcome?;

    info!(
        entity = %entity,
        sub_queue = sub_queue.as_str(),
        deleted = result.succeeded.len(),
        failed = result.failed.len(),
        not_found = result.not_found.len(),
        "delete finished"
    );
    Ok(result)
}
