//! Short-lived read-through cache for aggregate queries.
//!
//! Results here are query answers, not entities: they are never touched by
//! propagation messages and go stale purely by TTL.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::{codec, EntityKind, FieldKey, NodeField};
use quick_cache::sync::Cache;
use tokio::time::Instant;
use uuid::Uuid;

use super::types::ClusterError;
use crate::traits::ClusterStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum QueryKey {
    ActiveNodeIds,
    NodeSessionCount(Uuid),
}

#[derive(Debug, Clone)]
enum QueryValue {
    Ids(Arc<[Uuid]>),
    Count(usize),
}

/// TTL-bounded cache of expensive store scans.
pub struct QueryCache {
    ttl: Duration,
    entries: Cache<QueryKey, (Instant, QueryValue)>,
}

impl QueryCache {
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            entries: Cache::new(capacity.max(1)),
        }
    }

    fn fresh(&self, key: QueryKey) -> Option<QueryValue> {
        let (stored_at, value) = self.entries.get(&key)?;
        if stored_at.elapsed() < self.ttl {
            Some(value)
        } else {
            self.entries.remove(&key);
            None
        }
    }

    fn store(&self, key: QueryKey, value: QueryValue) {
        self.entries.insert(key, (Instant::now(), value));
    }

    /// Ids of every node record in the store.
    ///
    /// # Errors
    ///
    /// Store failures on a cache miss.
    pub async fn active_node_ids(
        &self,
        store: &dyn ClusterStore,
    ) -> Result<Arc<[Uuid]>, ClusterError> {
        if let Some(QueryValue::Ids(ids)) = self.fresh(QueryKey::ActiveNodeIds) {
            return Ok(ids);
        }
        let prefix = EntityKind::Node.key_prefix();
        let ids: Arc<[Uuid]> = store
            .scan(&prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .collect();
        self.store(QueryKey::ActiveNodeIds, QueryValue::Ids(Arc::clone(&ids)));
        Ok(ids)
    }

    /// Number of sessions attached to `node_id` according to the store.
    /// A missing or undecodable record counts as zero.
    ///
    /// # Errors
    ///
    /// Store failures on a cache miss.
    pub async fn node_session_count(
        &self,
        store: &dyn ClusterStore,
        node_id: Uuid,
    ) -> Result<usize, ClusterError> {
        let key = QueryKey::NodeSessionCount(node_id);
        if let Some(QueryValue::Count(count)) = self.fresh(key) {
            return Ok(count);
        }
        let raw = store
            .hget(
                &EntityKind::Node.record_key(node_id),
                NodeField::Sessions.as_str(),
            )
            .await?;
        let count = raw
            .as_deref()
            .and_then(codec::parse_id_set)
            .map_or(0, |ids| ids.len());
        self.store(key, QueryValue::Count(count));
        Ok(count)
    }

    /// Drops every cached answer.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::{ClusterNode, Entity};

    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn answers_are_reused_until_ttl_expires() {
        let store = MemoryStore::new();
        let cache = QueryCache::new(Duration::from_secs(5), 16);
        let first = Uuid::new_v4();
        store
            .hset_many(
                &EntityKind::Node.record_key(first),
                &ClusterNode::new(first, "a").to_record(),
            )
            .await
            .unwrap();
        assert_eq!(cache.active_node_ids(&store).await.unwrap().len(), 1);

        let second = Uuid::new_v4();
        store
            .hset_many(
                &EntityKind::Node.record_key(second),
                &ClusterNode::new(second, "b").to_record(),
            )
            .await
            .unwrap();
        assert_eq!(cache.active_node_ids(&store).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.active_node_ids(&store).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn session_count_reads_node_record() {
        let store = MemoryStore::new();
        let node_id = Uuid::new_v4();
        let mut node = ClusterNode::new(node_id, "a");
        node.session_ids.insert(Uuid::new_v4());
        node.session_ids.insert(Uuid::new_v4());
        store
            .hset_many(&EntityKind::Node.record_key(node_id), &node.to_record())
            .await
            .unwrap();

        let cache = QueryCache::new(Duration::from_secs(5), 16);
        assert_eq!(cache.node_session_count(&store, node_id).await.unwrap(), 2);
        assert_eq!(
            cache
                .node_session_count(&store, Uuid::new_v4())
                .await
                .unwrap(),
            0
        );
    }
}
