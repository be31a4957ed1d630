//! Message lifecycle engine.
//!
//! Every function takes the broker session explicitly; nothing here holds
//! credentials or shared state. Broker I/O within one call is sequential.

mod inventory;
mod peek;
mod purge;
mod resubmit;
mod sweep;

pub use inventory::{collect_inventory, entity_details};
pub use peek::peek_page;
pub use purge::delete_messages;
pub use resubmit::resubmit_messages;

use tracing::warn;

use crate::broker::{Receiver, Sender};
use crate::models::EntityRef;

async fn close_receiver(receiver: &mut dyn Receiver, entity: &EntityRef) {
    if let Err(e) = receiver.close().await {
        warn!(entity = %entity, error = %e, "failed to close receiver");
    }
}

async fn close_sender(sender: &mut dyn Sender, entity: &EntityRef) {
    if let Err(e) = sender.close().await {
        warn!(entity = %entity, error = %e, "failed to close sender");
    }
}
