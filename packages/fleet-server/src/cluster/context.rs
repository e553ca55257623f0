//! Per-node context passed by reference to every component.

use std::sync::Arc;

use dashmap::DashMap;
use fleet_core::ClockSource;
use uuid::Uuid;

use super::entities::EntityManager;
use super::lifecycle::NodeLifecycle;
use super::query_cache::QueryCache;
use super::types::ClusterConfig;
use crate::task::{handlers, TaskRegistry};
use crate::traits::{ClusterStore, SessionTransport, WorkerProbe};

/// Everything one node owns: its identity, the store handle, the entity
/// cache, the task table and the collaborators it acts through.
pub struct ClusterContext {
    pub node_id: Uuid,
    pub config: Arc<ClusterConfig>,
    pub store: Arc<dyn ClusterStore>,
    pub clock: Arc<dyn ClockSource>,
    pub entities: EntityManager,
    pub queries: QueryCache,
    pub tasks: TaskRegistry,
    pub transport: Arc<dyn SessionTransport>,
    pub probe: Arc<dyn WorkerProbe>,
    pub lifecycle: NodeLifecycle,
    /// Redirect tokens presented by arriving clients, keyed by session.
    pub(crate) pending_tokens: DashMap<Uuid, Vec<u8>>,
}

impl ClusterContext {
    /// Builds a context with the built-in task handlers registered.
    #[must_use]
    pub fn new(
        node_id: Uuid,
        config: ClusterConfig,
        store: Arc<dyn ClusterStore>,
        transport: Arc<dyn SessionTransport>,
        probe: Arc<dyn WorkerProbe>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let entities = EntityManager::new(node_id, Arc::clone(&store), Arc::clone(&clock));
        let queries = QueryCache::new(config.query_cache_ttl(), config.query_cache_capacity);
        let tasks = TaskRegistry::new();
        handlers::register_builtin(&tasks);
        Self {
            node_id,
            config: Arc::new(config),
            store,
            clock,
            entities,
            queries,
            tasks,
            transport,
            probe,
            lifecycle: NodeLifecycle::new(),
            pending_tokens: DashMap::new(),
        }
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }
}
