//! Applies peers' change notices to the local cache.
//!
//! One listener per entity kind, each on its own task, and each notice is
//! applied on a task of its own so a slow re-read of one entity never holds
//! up the others. Notices carry no value: a field notice makes the receiver
//! re-read that one field from the store under the entity's write lock, so
//! notices applied out of order still leave the latest stored value. Notices this node published itself are discarded, and nothing
//! applied here is broadcast again.

use std::sync::Arc;

use fleet_core::{
    is_allowed_update_key, ClusterNode, EntityKind, Group, PropagationMessage, Session,
    UpdateKind, Worker,
};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use super::context::ClusterContext;
use super::entities::{EntityManager, Replicated};
use super::types::ClusterError;
use crate::traits::Subscription;

/// What a received notice did to the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeOutcome {
    /// Published by this node; dropped.
    OwnOrigin,
    /// A `"new"` notice. Peers hydrate lazily, so nothing to do.
    Created,
    /// Evicted and detached from cached collections.
    Evicted,
    /// Field re-read and applied to the cached entity.
    Applied,
    /// The entity is not cached here; it will hydrate fresh when needed.
    NotCached,
    /// Malformed payload, disallowed field key, or a failed re-read.
    Rejected,
}

/// Handles one payload received on `kind`'s channel.
pub async fn apply_notice(entities: &EntityManager, kind: EntityKind, payload: &str) -> NoticeOutcome {
    let message = match PropagationMessage::parse(payload) {
        Ok(message) => message,
        Err(err) => {
            warn!(channel = kind.channel(), error = %err, "dropping malformed notice");
            return NoticeOutcome::Rejected;
        }
    };
    if message.origin == entities.node_id() {
        return NoticeOutcome::OwnOrigin;
    }
    if !is_allowed_update_key(kind, message.update.as_str()) {
        warn!(
            kind = %kind,
            entity_id = %message.entity_id,
            field = message.update.as_str(),
            "dropping notice with unknown field"
        );
        return NoticeOutcome::Rejected;
    }
    match kind {
        EntityKind::Node => apply::<ClusterNode>(entities, message).await,
        EntityKind::Worker => apply::<Worker>(entities, message).await,
        EntityKind::Session => apply::<Session>(entities, message).await,
        EntityKind::Group => apply::<Group>(entities, message).await,
    }
}

async fn apply<E: Replicated>(entities: &EntityManager, message: PropagationMessage) -> NoticeOutcome {
    let id = message.entity_id;
    match message.update {
        UpdateKind::Created => NoticeOutcome::Created,
        UpdateKind::Deleted => {
            entities.apply_remote_delete::<E>(id).await;
            debug!(kind = %E::KIND, entity_id = %id, origin = %message.origin, "evicted");
            NoticeOutcome::Evicted
        }
        UpdateKind::Field(key) => match entities.apply_remote_field::<E>(id, &key).await {
            Ok(true) => NoticeOutcome::Applied,
            Ok(false) => NoticeOutcome::NotCached,
            Err(err @ ClusterError::InvalidField(_)) => {
                warn!(kind = %E::KIND, entity_id = %id, field = %key, error = %err, "field not applied");
                NoticeOutcome::Rejected
            }
            Err(err) => {
                warn!(kind = %E::KIND, entity_id = %id, field = %key, error = %err, "field re-read failed");
                NoticeOutcome::Rejected
            }
        },
    }
}

/// Subscribes to every kind's channel and spawns one listener per channel.
///
/// # Errors
///
/// Store failures while subscribing.
pub async fn spawn_listeners(ctx: &Arc<ClusterContext>) -> Result<Vec<JoinHandle<()>>, ClusterError> {
    let mut handles = Vec::with_capacity(EntityKind::ALL.len());
    for kind in EntityKind::ALL {
        let subscription = ctx.store.subscribe(kind.channel()).await?;
        handles.push(spawn_listener(Arc::clone(ctx), kind, subscription));
    }
    Ok(handles)
}

fn spawn_listener(ctx: Arc<ClusterContext>, kind: EntityKind, mut notices: Subscription) -> JoinHandle<()> {
    let span = info_span!("node", node_id = %ctx.node_id, channel = kind.channel());
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    payload = notices.recv() => match payload {
                        Some(payload) => {
                            let ctx = Arc::clone(&ctx);
                            tokio::spawn(
                                async move {
                                    apply_notice(&ctx.entities, kind, &payload).await;
                                }
                                .in_current_span(),
                            );
                        }
                        None => break,
                    },
                    () = ctx.lifecycle.closing() => break,
                }
            }
            debug!("propagation listener stopped");
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleet_core::{NodeField, SessionField, SystemClock};
    use uuid::Uuid;

    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::test_node;

    fn pair() -> (EntityManager, EntityManager) {
        let store = Arc::new(MemoryStore::new());
        (
            EntityManager::new(Uuid::new_v4(), store.clone(), Arc::new(SystemClock)),
            EntityManager::new(Uuid::new_v4(), store, Arc::new(SystemClock)),
        )
    }

    #[tokio::test]
    async fn own_notices_are_discarded() {
        let (a, _) = pair();
        let id = Uuid::new_v4();
        a.create(Session::new(id, "alex")).await.unwrap();
        let before = a.get::<Session>(id).await.unwrap();

        let notice = PropagationMessage::field(a.node_id(), id, "online").encode();
        assert_eq!(
            apply_notice(&a, EntityKind::Session, &notice).await,
            NoticeOutcome::OwnOrigin
        );
        assert_eq!(a.get::<Session>(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn field_notice_converges_peer_cache() {
        let (a, b) = pair();
        let id = Uuid::new_v4();
        a.create(Session::new(id, "alex")).await.unwrap();
        b.get::<Session>(id).await.unwrap();

        a.update::<Session, _>(id, &[SessionField::Vanished], |s| s.vanished = true)
            .await
            .unwrap();
        let notice = PropagationMessage::field(a.node_id(), id, "vanished").encode();
        assert_eq!(
            apply_notice(&b, EntityKind::Session, &notice).await,
            NoticeOutcome::Applied
        );
        assert!(b.cached::<Session>(id).await.unwrap().vanished);

        // Applying the same notice twice is harmless.
        assert_eq!(
            apply_notice(&b, EntityKind::Session, &notice).await,
            NoticeOutcome::Applied
        );
        assert!(b.cached::<Session>(id).await.unwrap().vanished);
    }

    #[tokio::test]
    async fn unknown_fields_and_garbage_are_rejected() {
        let (a, b) = pair();
        let id = Uuid::new_v4();
        a.create(ClusterNode::new(id, "x")).await.unwrap();
        b.get::<ClusterNode>(id).await.unwrap();

        let notice = PropagationMessage::field(a.node_id(), id, "online").encode();
        assert_eq!(
            apply_notice(&b, EntityKind::Node, &notice).await,
            NoticeOutcome::Rejected
        );
        assert_eq!(
            apply_notice(&b, EntityKind::Node, "nonsense").await,
            NoticeOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn new_and_uncached_notices_do_not_hydrate() {
        let (a, b) = pair();
        let id = Uuid::new_v4();
        a.create(ClusterNode::new(id, "x")).await.unwrap();
        a.update::<ClusterNode, _>(id, &[NodeField::Maintenance], |n| n.maintenance = true)
            .await
            .unwrap();

        let created = PropagationMessage {
            origin: a.node_id(),
            entity_id: id,
            update: UpdateKind::Created,
        };
        assert_eq!(
            apply_notice(&b, EntityKind::Node, &created.encode()).await,
            NoticeOutcome::Created
        );
        let field = PropagationMessage::field(a.node_id(), id, "maintenance").encode();
        assert_eq!(
            apply_notice(&b, EntityKind::Node, &field).await,
            NoticeOutcome::NotCached
        );
        assert_eq!(b.cached_count::<ClusterNode>(), 0);
    }

    #[tokio::test]
    async fn delete_notice_evicts() {
        let (a, b) = pair();
        let id = Uuid::new_v4();
        a.create(Group::new(id, Uuid::new_v4())).await.unwrap();
        b.get::<Group>(id).await.unwrap();

        a.delete::<Group>(id).await.unwrap();
        let notice = PropagationMessage {
            origin: a.node_id(),
            entity_id: id,
            update: UpdateKind::Deleted,
        };
        assert_eq!(
            apply_notice(&b, EntityKind::Group, &notice.encode()).await,
            NoticeOutcome::Evicted
        );
        assert!(b.cached::<Group>(id).await.is_none());
    }

    #[tokio::test]
    async fn blocked_entity_does_not_delay_others_of_its_kind() {
        let store = Arc::new(MemoryStore::new());
        let a = test_node(&store);
        let b = test_node(&store);
        let _listeners = spawn_listeners(&b.ctx).await.unwrap();

        let (stuck, free) = (Uuid::new_v4(), Uuid::new_v4());
        for id in [stuck, free] {
            a.ctx.entities.create(Session::new(id, "p")).await.unwrap();
            b.ctx.entities.get::<Session>(id).await.unwrap();
        }
        let held = b.ctx.entities.handle::<Session>(stuck).await.unwrap();
        let guard = held.write().await;

        for id in [stuck, free] {
            a.ctx
                .entities
                .update::<Session, _>(id, &[SessionField::Vanished], |s| s.vanished = true)
                .await
                .unwrap();
        }

        let converged = tokio::time::timeout(Duration::from_secs(1), async {
            while !b.ctx.entities.cached::<Session>(free).await.is_some_and(|s| s.vanished) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(converged.is_ok(), "notice for an unrelated session was held up");

        drop(guard);
        b.ctx.lifecycle.advance(crate::cluster::HealthState::Closing);
    }
}
