use crate::broker::Broker;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::models::{EntityCounters, EntityRef, MessagePage, SubQueue, total_pages};

use super::close_receiver;

/// Read one page of a sub-queue without locking or removing anything.
///
/// The total is read from runtime counters on every call; peek itself gives
/// no stable total. Pages are not consistent with each other under
/// concurrent traffic, so callers may see duplicates or gaps across pages.
pub async fn peek_page(
    broker: &dyn Broker,
    entity: &EntityRef,
    sub_queue: SubQueue,
    page_index: u32,
    cfg: &EngineConfig,
) -> Result<MessagePage> {
    if !entity.is_receivable() {
        return Err(Error::invalid(format!("'{entity}' holds no messages to peek")));
    }

    let counters = EntityCounters::from(broker.runtime_counters(entity).await?);
    let total_messages = match sub_queue {
        SubQueue::Active => counters.active_message_count,
        SubQueue::DeadLetter => counters.dead_letter_count,
    };
    let total_pages = total_pages(total_messages, cfg.page_size);

    let skip = u64::from(page_index) * u64::from(cfg.page_size);
    let mut receiver = broker.open_receiver(entity, sub_queue).await?;
    let peeked = receiver.peek(skip, cfg.page_size).await;
    close_receiver(receiver.as_mut(), entity).await;

    Ok(MessagePage {
        messages: peeked?,
        total_messages,
        current_page: page_index,
        total_pages,
        has_more: u64::from(page_index) + 1 < u64::from(total_pages),
    })
}
