//! Handler table keyed by task discriminator.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fleet_core::TaskResult;

use super::operation::{Task, TaskKind};
use crate::cluster::ClusterContext;

/// Executes one kind of task on the node that owns the target.
///
/// An `Err` is reported to the caller as a failed [`TaskResult`] carrying
/// the error's message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &ClusterContext, task: Task) -> anyhow::Result<TaskResult>;
}

/// Registry of task handlers. Registering a kind twice replaces the first
/// handler.
pub struct TaskRegistry {
    handlers: DashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register<H: TaskHandler + 'static>(&self, kind: TaskKind, handler: H) {
        self.handlers.insert(kind, Arc::new(handler));
    }

    #[must_use]
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn is_registered(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl TaskHandler for Fixed {
        async fn handle(&self, _ctx: &ClusterContext, _task: Task) -> anyhow::Result<TaskResult> {
            Ok(TaskResult::ok(self.0))
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = TaskRegistry::new();
        assert!(registry.is_empty());
        registry.register(TaskKind::KickSession, Fixed("a"));
        assert!(registry.is_registered(TaskKind::KickSession));
        assert!(!registry.is_registered(TaskKind::BanSession));
        assert!(registry.get(TaskKind::BanSession).is_none());

        registry.register(TaskKind::KickSession, Fixed("b"));
        assert_eq!(registry.len(), 1);
    }
}
