use tracing::warn;

use crate::broker::Broker;
use crate::error::Result;
use crate::models::{
    EntityCounters, EntityRef, Inventory, QueueEntity, SubscriptionEntity, TopicEntity,
};

/// Snapshot every queue, topic and subscription with live counters.
///
/// Listing failures are fatal (the broker is unreachable). A counter failure
/// on a single entity is logged and that entity is reported with zeroes.
pub async fn collect_inventory(broker: &dyn Broker) -> Result<Inventory> {
    let mut inventory = Inventory::default();

    for queue in broker.list_queues().await? {
        let counters = counters_or_zero(broker, &EntityRef::queue(&queue.name)).await;
        inventory.queues.push(QueueEntity {
            name: queue.name,
            status: queue.status,
            created_at: queue.created_at,
            counters,
        });
    }

    for topic in broker.list_topics().await? {
        let subscriptions = match broker.list_subscriptions(&topic.name).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(topic = %topic.name, error = %e, "failed to list subscriptions");
                Vec::new()
            }
        };

        let mut children = Vec::with_capacity(subscriptions.len());
        for sub in subscriptions {
            let entity = EntityRef::subscription(&topic.name, &sub.name);
            let counters = counters_or_zero(broker, &entity).await;
            children.push(SubscriptionEntity {
                topic_name: topic.name.clone(),
                subscription_name: sub.name,
                status: sub.status,
                created_at: sub.created_at,
                counters,
            });
        }

        let counters = counters_or_zero(broker, &EntityRef::topic(&topic.name)).await;
        inventory.topics.push(TopicEntity {
            name: topic.name,
            status: topic.status,
            created_at: topic.created_at,
            counters,
            subscriptions: children,
        });
    }

    Ok(inventory)
}

/// Fresh counters for one entity. Unlike the inventory, failures propagate.
pub async fn entity_details(broker: &dyn Broker, entity: &EntityRef) -> Result<EntityCounters> {
    let rt = broker.runtime_counters(entity).await?;
    Ok(rt.into())
}

async fn counters_or_zero(broker: &dyn Broker, entity: &EntityRef) -> EntityCounters {
    match broker.runtime_counters(entity).await {
        Ok(rt) => rt.into(),
        Err(e) => {
            warn!(entity = %entity, error = %e, "failed to fetch runtime counters");
            EntityCounters::zeroed()
        }
    }
}
