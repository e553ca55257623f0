//! Per-node entity cache.
//!
//! Each entity kind has its own concurrent registry (`EntityMap`) of
//! `id -> Arc<RwLock<E>>`. Entities are hydrated lazily from the store on
//! first reference and kept current field by field.
//!
//! Locking rules:
//! - A registry shard is only held long enough to clone the entity's `Arc`;
//!   it is never held while an entity lock is awaited.
//! - Writers hold the entity's write lock across the store write so local
//!   updates to one entity are applied in order.
//! - Operations touching several entities lock them one after another, never
//!   nested.

use std::sync::Arc;

use dashmap::DashMap;
use fleet_core::{
    ClockSource, ClusterNode, Entity, EntityError, FieldKey, Group, PropagationMessage, Session,
    UpdateKind, Worker,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::ClusterError;
use crate::traits::ClusterStore;

// ---------------------------------------------------------------------------
// EntityMap
// ---------------------------------------------------------------------------

/// Concurrent registry of cached entities of one kind.
pub struct EntityMap<E: Entity> {
    entries: DashMap<Uuid, Arc<RwLock<E>>>,
}

impl<E: Entity> EntityMap<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn get(&self, id: Uuid) -> Option<Arc<RwLock<E>>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Registers `entity` unless another task registered the same id first;
    /// returns whichever instance ended up in the map.
    fn register(&self, entity: E) -> Arc<RwLock<E>> {
        let id = entity.id();
        Arc::clone(
            self.entries
                .entry(id)
                .or_insert_with(|| Arc::new(RwLock::new(entity)))
                .value(),
        )
    }

    fn replace(&self, entity: E) {
        self.entries
            .insert(entity.id(), Arc::new(RwLock::new(entity)));
    }

    fn remove(&self, id: Uuid) -> Option<Arc<RwLock<E>>> {
        self.entries.remove(&id).map(|(_, entity)| entity)
    }

    fn ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<E: Entity> Default for EntityMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached references that point at an entity removed by another node.
pub enum DanglingRefs {
    None,
    /// A worker: its node's `worker_ids` entry and its sessions' `worker_id`.
    Worker {
        worker_id: Uuid,
        node_id: Uuid,
        session_ids: Vec<Uuid>,
    },
    /// A group: its members' `group_id`.
    Group { group_id: Uuid, member_ids: Vec<Uuid> },
    /// A node: its cached workers go with it.
    Node { worker_ids: Vec<Uuid> },
}

/// Entity kinds the manager keeps a registry for.
pub trait Replicated: Entity {
    fn registry(manager: &EntityManager) -> &EntityMap<Self>;

    fn dangling_refs(&self) -> DanglingRefs;
}

impl Replicated for ClusterNode {
    fn registry(manager: &EntityManager) -> &EntityMap<Self> {
        &manager.nodes
    }

    fn dangling_refs(&self) -> DanglingRefs {
        DanglingRefs::Node {
            worker_ids: self.worker_ids.iter().copied().collect(),
        }
    }
}

impl Replicated for Worker {
    fn registry(manager: &EntityManager) -> &EntityMap<Self> {
        &manager.workers
    }

    fn dangling_refs(&self) -> DanglingRefs {
        DanglingRefs::Worker {
            worker_id: self.id,
            node_id: self.node_id,
            session_ids: self.session_ids.iter().copied().collect(),
        }
    }
}

impl Replicated for Session {
    fn registry(manager: &EntityManager) -> &EntityMap<Self> {
        &manager.sessions
    }

    fn dangling_refs(&self) -> DanglingRefs {
        DanglingRefs::None
    }
}

impl Replicated for Group {
    fn registry(manager: &EntityManager) -> &EntityMap<Self> {
        &manager.groups
    }

    fn dangling_refs(&self) -> DanglingRefs {
        DanglingRefs::Group {
            group_id: self.id,
            member_ids: self.member_ids.iter().copied().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityManager
// ---------------------------------------------------------------------------

/// Cache of every entity this node has referenced, plus the write path that
/// keeps the store and peers informed.
pub struct EntityManager {
    node_id: Uuid,
    store: Arc<dyn ClusterStore>,
    clock: Arc<dyn ClockSource>,
    nodes: EntityMap<ClusterNode>,
    workers: EntityMap<Worker>,
    sessions: EntityMap<Session>,
    groups: EntityMap<Group>,
}

impl EntityManager {
    #[must_use]
    pub fn new(node_id: Uuid, store: Arc<dyn ClusterStore>, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            node_id,
            store,
            clock,
            nodes: EntityMap::new(),
            workers: EntityMap::new(),
            sessions: EntityMap::new(),
            groups: EntityMap::new(),
        }
    }

    /// Id of the node owning this cache; used as the origin of broadcasts.
    #[must_use]
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    /// Current time from the injected clock, in epoch millis.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    // -- Reads -------------------------------------------------------------

    /// Returns the shared handle for `id`, hydrating it from the store on a miss.
    ///
    /// Two concurrent misses may both read the store; the first registration
    /// wins and the second caller receives the same handle.
    ///
    /// # Errors
    ///
    /// `NotFound` when the store has no record, `InvalidField` when the
    /// record does not decode, `Store` on store failure.
    pub async fn handle<E: Replicated>(&self, id: Uuid) -> Result<Arc<RwLock<E>>, ClusterError> {
        if let Some(cached) = E::registry(self).get(id) {
            return Ok(cached);
        }
        let record = self
            .store
            .hgetall(&E::KIND.record_key(id))
            .await?
            .ok_or_else(|| ClusterError::not_found(E::KIND, id))?;
        let entity = E::from_record(id, &record)?;
        debug!(kind = %E::KIND, entity_id = %id, "hydrated entity from store");
        Ok(E::registry(self).register(entity))
    }

    /// Snapshot of entity `id`.
    ///
    /// # Errors
    ///
    /// See [`EntityManager::handle`].
    pub async fn get<E: Replicated>(&self, id: Uuid) -> Result<E, ClusterError> {
        let handle = self.handle::<E>(id).await?;
        let snapshot = handle.read().await.clone();
        Ok(snapshot)
    }

    /// Like [`EntityManager::get`], but maps `NotFound` to `None`.
    ///
    /// # Errors
    ///
    /// Store and decode failures.
    pub async fn try_get<E: Replicated>(&self, id: Uuid) -> Result<Option<E>, ClusterError> {
        match self.get::<E>(id).await {
            Ok(entity) => Ok(Some(entity)),
            Err(ClusterError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Reads entity `id` straight from the store, bypassing the cache. A
    /// cached copy is replaced with what was read, or evicted when the record
    /// is gone.
    ///
    /// # Errors
    ///
    /// Store and decode failures.
    pub async fn load_fresh<E: Replicated>(&self, id: Uuid) -> Result<Option<E>, ClusterError> {
        let Some(record) = self.store.hgetall(&E::KIND.record_key(id)).await? else {
            E::registry(self).remove(id);
            return Ok(None);
        };
        let entity = E::from_record(id, &record)?;
        if let Some(handle) = E::registry(self).get(id) {
            *handle.write().await = entity.clone();
        }
        Ok(Some(entity))
    }

    /// Snapshot of a cached entity without touching the store.
    pub async fn cached<E: Replicated>(&self, id: Uuid) -> Option<E> {
        let handle = E::registry(self).get(id)?;
        let snapshot = handle.read().await.clone();
        Some(snapshot)
    }

    /// Ids currently held in this node's cache.
    #[must_use]
    pub fn cached_ids<E: Replicated>(&self) -> Vec<Uuid> {
        E::registry(self).ids()
    }

    #[must_use]
    pub fn cached_count<E: Replicated>(&self) -> usize {
        E::registry(self).len()
    }

    /// Ids of every record of kind `E` in the store.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn stored_ids<E: Replicated>(&self) -> Result<Vec<Uuid>, ClusterError> {
        let prefix = E::KIND.key_prefix();
        let keys = self.store.scan(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .collect())
    }

    // -- Writes ------------------------------------------------------------

    /// Writes a new record, caches it, and announces it with `"new"`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when a record with the same id is already stored.
    pub async fn create<E: Replicated>(&self, entity: E) -> Result<E, ClusterError> {
        let id = entity.id();
        let key = E::KIND.record_key(id);
        if self.store.hgetall(&key).await?.is_some() {
            return Err(ClusterError::AlreadyExists { kind: E::KIND, id });
        }
        self.store.hset_many(&key, &entity.to_record()).await?;
        E::registry(self).replace(entity.clone());
        self.announce(E::KIND.channel(), id, UpdateKind::Created)
            .await?;
        Ok(entity)
    }

    /// Removes the record, evicts it, and announces `"delete"`.
    ///
    /// Relationship cleanup (detaching sessions from a worker, and so on) is
    /// the caller's job; see the cascading operations in `sessions`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn delete<E: Replicated>(&self, id: Uuid) -> Result<(), ClusterError> {
        self.store.delete(&E::KIND.record_key(id)).await?;
        E::registry(self).remove(id);
        self.announce(E::KIND.channel(), id, UpdateKind::Deleted)
            .await
    }

    /// Mutates entity `id` and persists the listed `fields`.
    ///
    /// The mutator runs on a copy; the listed fields are written to the store
    /// first, then applied to the cached entity, then announced to peers with
    /// this node as origin. Changes the mutator makes to unlisted fields are
    /// discarded.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown entities, including a cached entity whose
    /// record is already gone from the store; that copy is evicted and
    /// nothing is written. `Store` on store failure. A failed store write
    /// leaves the cache untouched.
    pub async fn update<E, F>(
        &self,
        id: Uuid,
        fields: &[E::Field],
        mutator: F,
    ) -> Result<E, ClusterError>
    where
        E: Replicated,
        F: FnOnce(&mut E),
    {
        let handle = self.handle::<E>(id).await?;
        let snapshot = {
            let mut current = handle.write().await;
            let mut next = current.clone();
            mutator(&mut next);

            let encoded: Vec<(String, String)> = fields
                .iter()
                .map(|&f| (f.as_str().to_string(), next.encode_field(f)))
                .collect();
            if self
                .store
                .hset_existing(&E::KIND.record_key(id), &encoded)
                .await?
            {
                for (&field, (_, raw)) in fields.iter().zip(&encoded) {
                    current.apply_field(field, raw)?;
                }
                Some(current.clone())
            } else {
                None
            }
        };
        let Some(snapshot) = snapshot else {
            // Deleted by a peer whose notice has not arrived yet.
            debug!(kind = %E::KIND, entity_id = %id, "update raced a delete");
            self.apply_remote_delete::<E>(id).await;
            return Err(ClusterError::not_found(E::KIND, id));
        };

        for &field in fields {
            self.announce(
                E::KIND.channel(),
                id,
                UpdateKind::Field(field.as_str().to_string()),
            )
            .await?;
        }
        Ok(snapshot)
    }

    async fn announce(
        &self,
        channel: &str,
        entity_id: Uuid,
        update: UpdateKind,
    ) -> Result<(), ClusterError> {
        let message = PropagationMessage {
            origin: self.node_id,
            entity_id,
            update,
        };
        self.store.publish(channel, &message.encode()).await?;
        Ok(())
    }

    // -- Remote application (no re-broadcast) -------------------------------

    /// Re-reads `field_key` of entity `id` from the store and applies it to
    /// the cached copy. Entities that are not cached are left alone; they
    /// will hydrate with the new value on first reference.
    ///
    /// Returns `true` when a cached entity was updated.
    ///
    /// # Errors
    ///
    /// `InvalidField` for keys outside the kind's allowed set.
    pub async fn apply_remote_field<E: Replicated>(
        &self,
        id: Uuid,
        field_key: &str,
    ) -> Result<bool, ClusterError> {
        let field = E::Field::parse(field_key).ok_or_else(|| EntityError::UnknownField {
            kind: E::KIND,
            key: field_key.to_string(),
        })?;
        let Some(handle) = E::registry(self).get(id) else {
            return Ok(false);
        };
        let mut current = handle.write().await;
        let Some(raw) = self
            .store
            .hget(&E::KIND.record_key(id), field_key)
            .await?
        else {
            return Ok(false);
        };
        current.apply_field(field, &raw)?;
        Ok(true)
    }

    /// Applies a remote deletion: evicts the entity and detaches it from any
    /// cached collection that references it.
    pub async fn apply_remote_delete<E: Replicated>(&self, id: Uuid) {
        let Some(handle) = E::registry(self).remove(id) else {
            return;
        };
        let refs = handle.read().await.dangling_refs();
        self.drop_dangling_refs(refs).await;
    }

    async fn drop_dangling_refs(&self, refs: DanglingRefs) {
        match refs {
            DanglingRefs::None => {}
            DanglingRefs::Worker {
                worker_id,
                node_id,
                session_ids,
            } => {
                if let Some(node) = self.nodes.get(node_id) {
                    node.write().await.worker_ids.remove(&worker_id);
                }
                for session_id in session_ids {
                    if let Some(session) = self.sessions.get(session_id) {
                        let mut session = session.write().await;
                        if session.worker_id == Some(worker_id) {
                            session.worker_id = None;
                        }
                    }
                }
            }
            DanglingRefs::Group {
                group_id,
                member_ids,
            } => {
                for member in member_ids {
                    if let Some(session) = self.sessions.get(member) {
                        let mut session = session.write().await;
                        if session.group_id == Some(group_id) {
                            session.group_id = None;
                        }
                    }
                }
            }
            DanglingRefs::Node { worker_ids } => {
                for worker_id in worker_ids {
                    self.workers.remove(worker_id);
                }
            }
        }
    }

    /// Loads every stored node record into the cache. Used at startup so the
    /// crash sweep and load balancing start from a warm view.
    ///
    /// # Errors
    ///
    /// Store failures. Undecodable records are skipped with a warning.
    pub async fn warm_nodes(&self) -> Result<usize, ClusterError> {
        let mut loaded = 0;
        for id in self.stored_ids::<ClusterNode>().await? {
            match self.handle::<ClusterNode>(id).await {
                Ok(_) => loaded += 1,
                Err(ClusterError::NotFound { .. }) => {}
                Err(err) => warn!(entity_id = %id, error = %err, "skipping node record"),
            }
        }
        Ok(loaded)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use fleet_core::{NodeField, SessionField, SystemClock, WorkerField};

    use super::*;
    use crate::storage::MemoryStore;

    fn manager(store: &Arc<MemoryStore>) -> EntityManager {
        EntityManager::new(Uuid::new_v4(), store.clone(), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn get_missing_entity_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let entities = manager(&store);
        let err = entities.get::<Session>(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound { .. }));
        assert!(entities
            .try_get::<Session>(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn lazy_hydration_from_store() {
        let store = Arc::new(MemoryStore::new());
        let id = Uuid::new_v4();
        let session = Session::new(id, "alex");
        store
            .hset_many(&fleet_core::EntityKind::Session.record_key(id), &session.to_record())
            .await
            .unwrap();

        let entities = manager(&store);
        assert_eq!(entities.cached_count::<Session>(), 0);
        let loaded = entities.get::<Session>(id).await.unwrap();
        assert_eq!(loaded, session);
        assert_eq!(entities.cached_count::<Session>(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_handle() {
        let store = Arc::new(MemoryStore::new());
        let id = Uuid::new_v4();
        store
            .hset_many(
                &fleet_core::EntityKind::Worker.record_key(id),
                &Worker::new(id, "10.0.0.5:25565", Uuid::new_v4()).to_record(),
            )
            .await
            .unwrap();

        let entities = manager(&store);
        let (a, b) = tokio::join!(entities.handle::<Worker>(id), entities.handle::<Worker>(id));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(entities.cached_count::<Worker>(), 1);
    }

    #[tokio::test]
    async fn update_is_visible_locally_and_in_store() {
        let store = Arc::new(MemoryStore::new());
        let entities = manager(&store);
        let id = Uuid::new_v4();
        entities.create(Session::new(id, "alex")).await.unwrap();

        entities
            .update::<Session, _>(id, &[SessionField::Vanished], |s| s.vanished = true)
            .await
            .unwrap();

        assert!(entities.get::<Session>(id).await.unwrap().vanished);
        assert_eq!(
            store
                .hget(&fleet_core::EntityKind::Session.record_key(id), "vanished")
                .await
                .unwrap()
                .as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn update_ignores_unlisted_fields() {
        let store = Arc::new(MemoryStore::new());
        let entities = manager(&store);
        let id = Uuid::new_v4();
        entities.create(Session::new(id, "alex")).await.unwrap();

        let updated = entities
            .update::<Session, _>(id, &[SessionField::Vanished], |s| {
                s.vanished = true;
                s.online = true;
            })
            .await
            .unwrap();
        assert!(updated.vanished);
        assert!(!updated.online);
    }

    #[tokio::test]
    async fn writes_announce_field_and_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let entities = manager(&store);
        let mut sub = store
            .subscribe(fleet_core::EntityKind::Node.channel())
            .await
            .unwrap();
        let id = Uuid::new_v4();

        entities.create(ClusterNode::new(id, "proxy-1")).await.unwrap();
        entities
            .update::<ClusterNode, _>(id, &[NodeField::Maintenance], |n| n.maintenance = true)
            .await
            .unwrap();
        entities.delete::<ClusterNode>(id).await.unwrap();

        let origin = entities.node_id();
        let expected = [
            PropagationMessage { origin, entity_id: id, update: UpdateKind::Created },
            PropagationMessage::field(origin, id, "maintenance"),
            PropagationMessage { origin, entity_id: id, update: UpdateKind::Deleted },
        ];
        for message in expected {
            let payload = sub.recv().await.unwrap();
            assert_eq!(PropagationMessage::parse(&payload).unwrap(), message);
        }
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let entities = manager(&store);
        let id = Uuid::new_v4();
        entities.create(Group::new(id, Uuid::new_v4())).await.unwrap();
        let err = entities.create(Group::new(id, Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn remote_field_applies_only_to_cached_entities() {
        let store = Arc::new(MemoryStore::new());
        let writer = manager(&store);
        let reader = manager(&store);
        let id = Uuid::new_v4();
        writer
            .create(Worker::new(id, "10.0.0.5:25565", writer.node_id()))
            .await
            .unwrap();

        // Not cached on the reader yet: nothing to apply.
        assert!(!reader.apply_remote_field::<Worker>(id, "maintenance").await.unwrap());

        reader.get::<Worker>(id).await.unwrap();
        writer
            .update::<Worker, _>(id, &[WorkerField::Maintenance], |w| w.maintenance = true)
            .await
            .unwrap();
        assert!(!reader.cached::<Worker>(id).await.unwrap().maintenance);

        assert!(reader.apply_remote_field::<Worker>(id, "maintenance").await.unwrap());
        assert!(reader.cached::<Worker>(id).await.unwrap().maintenance);
    }

    #[tokio::test]
    async fn remote_field_rejects_unknown_key() {
        let store = Arc::new(MemoryStore::new());
        let entities = manager(&store);
        let err = entities
            .apply_remote_field::<Worker>(Uuid::new_v4(), "online")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidField(_)));
    }

    #[tokio::test]
    async fn remote_delete_detaches_worker_from_cached_node_and_sessions() {
        let store = Arc::new(MemoryStore::new());
        let entities = manager(&store);
        let node_id = Uuid::new_v4();
        let worker_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let mut node = ClusterNode::new(node_id, "proxy");
        node.worker_ids.insert(worker_id);
        let mut worker = Worker::new(worker_id, "w", node_id);
        worker.session_ids.insert(session_id);
        let mut session = Session::new(session_id, "alex");
        session.worker_id = Some(worker_id);
        entities.create(node).await.unwrap();
        entities.create(worker).await.unwrap();
        entities.create(session).await.unwrap();

        entities.apply_remote_delete::<Worker>(worker_id).await;

        assert!(entities.cached::<Worker>(worker_id).await.is_none());
        assert!(entities
            .cached::<ClusterNode>(node_id)
            .await
            .unwrap()
            .worker_ids
            .is_empty());
        assert_eq!(entities.cached::<Session>(session_id).await.unwrap().worker_id, None);
    }

    #[tokio::test]
    async fn stored_ids_and_warm_nodes() {
        let store = Arc::new(MemoryStore::new());
        let writer = manager(&store);
        for n in 0..3 {
            writer
                .create(ClusterNode::new(Uuid::new_v4(), format!("proxy-{n}")))
                .await
                .unwrap();
        }
        let reader = manager(&store);
        assert_eq!(reader.stored_ids::<ClusterNode>().await.unwrap().len(), 3);
        assert_eq!(reader.warm_nodes().await.unwrap(), 3);
        assert_eq!(reader.cached_count::<ClusterNode>(), 3);
    }

    #[tokio::test]
    async fn update_after_peer_delete_does_not_resurrect_record() {
        let store = Arc::new(MemoryStore::new());
        let owner = manager(&store);
        let stale = manager(&store);
        let group_id = Uuid::new_v4();
        let member = Uuid::new_v4();
        let mut session = Session::new(member, "alex");
        session.group_id = Some(group_id);
        stale.create(session).await.unwrap();
        owner.create(Group::new(group_id, member)).await.unwrap();
        stale.get::<Group>(group_id).await.unwrap();

        // The delete notice has not reached `stale` yet.
        owner.delete::<Group>(group_id).await.unwrap();
        let err = stale
            .update::<Group, _>(group_id, &[fleet_core::GroupField::Invitations], |g| {
                g.invitation_ids.insert(Uuid::new_v4());
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::NotFound { .. }));
        let key = fleet_core::EntityKind::Group.record_key(group_id);
        assert!(store.hgetall(&key).await.unwrap().is_none());
        assert!(stale.cached::<Group>(group_id).await.is_none());
        assert_eq!(stale.cached::<Session>(member).await.unwrap().group_id, None);
        assert!(manager(&store).try_get::<Group>(group_id).await.unwrap().is_none());
    }
}
