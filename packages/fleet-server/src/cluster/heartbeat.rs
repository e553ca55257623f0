//! Heartbeat, cleanup-leader election and the crash sweep.
//!
//! Every cycle a node stamps its own `last_heartbeat`, then competes for the
//! cluster-wide cleanup lock. The winner scans every other node and cleans up
//! those whose heartbeat is older than the staleness threshold. The lock is
//! kept until the next cycle, which releases it before competing again, so
//! leadership changes at most once per interval.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{ClusterNode, NodeField, Session};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::ClusterContext;
use super::types::ClusterError;
use crate::worker::Periodic;

impl ClusterContext {
    /// Writes the current time as this node's heartbeat.
    ///
    /// # Errors
    ///
    /// Store failures, or `NotFound` when this node's record is gone.
    pub async fn beat(&self) -> Result<(), ClusterError> {
        let now = self.now();
        self.entities
            .update::<ClusterNode, _>(self.node_id, &[NodeField::LastHeartbeat], |node| {
                node.last_heartbeat = Some(now);
            })
            .await?;
        Ok(())
    }

    fn lock_owner(&self) -> String {
        self.node_id.to_string()
    }

    /// Tries to take the cleanup lock. Not reentrant: a node already holding
    /// it gets `false` until it releases or the TTL runs out.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn try_acquire_leadership(&self) -> Result<bool, ClusterError> {
        Ok(self
            .store
            .try_lock(
                &self.config.leader_lock_key,
                &self.lock_owner(),
                self.config.leader_lock_ttl(),
            )
            .await?)
    }

    /// Releases the cleanup lock if this node holds it.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn release_leadership(&self) -> Result<(), ClusterError> {
        self.store
            .unlock(&self.config.leader_lock_key, &self.lock_owner())
            .await?;
        Ok(())
    }

    /// Scans every other node record and cleans up the stale ones. Returns
    /// the ids of the nodes declared crashed.
    ///
    /// Node records are read from the store, not the cache, so a missed
    /// heartbeat notice cannot make a live node look dead.
    ///
    /// # Errors
    ///
    /// Store failures while listing nodes. Failures cleaning up one node are
    /// logged and the scan moves on.
    pub async fn sweep_crashed_nodes(&self) -> Result<Vec<Uuid>, ClusterError> {
        let threshold_ms = self.config.staleness_threshold_ms();
        let now = self.now();
        let mut crashed = Vec::new();

        for id in self.entities.stored_ids::<ClusterNode>().await? {
            if id == self.node_id {
                continue;
            }
            let node = match self.entities.load_fresh::<ClusterNode>(id).await {
                Ok(Some(node)) => node,
                Ok(None) => continue,
                Err(err) => {
                    warn!(node = %id, error = %err, "unreadable node record");
                    continue;
                }
            };
            if !node.is_stale(now, threshold_ms) {
                continue;
            }
            info!(
                node = %id,
                last_heartbeat = ?node.last_heartbeat,
                threshold_ms,
                "declaring node crashed"
            );
            match self.retire_node(&node).await {
                Ok(()) => crashed.push(id),
                Err(err) => warn!(node = %id, error = %err, "crash cleanup incomplete"),
            }
        }
        if !crashed.is_empty() {
            self.queries.clear();
        }
        Ok(crashed)
    }

    /// Deletes a node's workers, takes the sessions still pointing at it
    /// offline with a fresh last-seen stamp, and deletes its record. Used for
    /// crashed nodes and for this node's own clean shutdown. Safe to repeat.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn retire_node(&self, node: &ClusterNode) -> Result<(), ClusterError> {
        for worker_id in &node.worker_ids {
            match self.entities.delete_worker(*worker_id).await {
                Ok(()) | Err(ClusterError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        for session_id in &node.session_ids {
            match self.entities.get::<Session>(*session_id).await {
                Ok(session) if session.node_id == Some(node.id) => {
                    self.entities.mark_offline(*session_id).await?;
                }
                Ok(_) | Err(ClusterError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        self.entities.delete::<ClusterNode>(node.id).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Heartbeat runnable
// ---------------------------------------------------------------------------

/// What one heartbeat cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub beat: bool,
    pub leader: bool,
    pub crashed: Vec<Uuid>,
    /// Cached sessions found online without a node.
    pub invariant_violations: usize,
}

/// Heartbeat cycles, driven by a [`crate::worker::PeriodicTask`].
pub struct Heartbeat {
    ctx: Arc<ClusterContext>,
    leading: bool,
}

impl Heartbeat {
    #[must_use]
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx, leading: false }
    }

    /// Beat, give up last cycle's leadership, then compete for it again.
    pub async fn cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        match self.ctx.beat().await {
            Ok(()) => report.beat = true,
            Err(err) => warn!(error = %err, "heartbeat failed"),
        }

        if self.leading {
            self.step_down().await;
        }
        match self.ctx.try_acquire_leadership().await {
            Ok(true) => {
                self.leading = true;
                report.leader = true;
                debug!("acquired cleanup lock");
                match self.ctx.sweep_crashed_nodes().await {
                    Ok(crashed) => report.crashed = crashed,
                    Err(err) => warn!(error = %err, "crash sweep failed"),
                }
            }
            Ok(false) => debug!("cleanup lock held elsewhere"),
            Err(err) => warn!(error = %err, "cleanup lock attempt failed"),
        }
        report.invariant_violations = self.ctx.entities.check_cached_sessions().await;
        report
    }

    async fn step_down(&mut self) {
        if let Err(err) = self.ctx.release_leadership().await {
            warn!(error = %err, "failed to release cleanup lock");
        }
        self.leading = false;
    }
}

#[async_trait]
impl Periodic for Heartbeat {
    async fn tick(&mut self) {
        self.cycle().await;
    }

    async fn finish(&mut self) {
        if self.leading {
            self.step_down().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::Worker;

    use super::*;
    use crate::cluster::ClusterConfig;
    use crate::storage::MemoryStore;
    use crate::testing::{test_node, test_node_with, T0};

    const MINUTE: u64 = 60_000;

    fn sweep_config() -> ClusterConfig {
        ClusterConfig {
            heartbeat_interval_ms: 150_000,
            staleness_intervals: 2,
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn beat_writes_last_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        let node = test_node(&store);
        node.ctx.entities.register_node("a").await.unwrap();
        node.clock.advance(MINUTE);

        node.ctx.beat().await.unwrap();

        let stored = node.ctx.entities.load_fresh::<ClusterNode>(node.ctx.node_id).await.unwrap().unwrap();
        assert_eq!(stored.last_heartbeat, Some(T0 + MINUTE));
    }

    #[tokio::test]
    async fn only_one_racing_node_becomes_leader() {
        let store = Arc::new(MemoryStore::new());
        let a = test_node(&store);
        let b = test_node(&store);

        let (won_a, won_b) = tokio::join!(
            a.ctx.try_acquire_leadership(),
            b.ctx.try_acquire_leadership()
        );
        assert!(won_a.unwrap() ^ won_b.unwrap());
    }

    #[tokio::test]
    async fn leader_keeps_lock_until_next_cycle() {
        let store = Arc::new(MemoryStore::new());
        let a = test_node(&store);
        let b = test_node(&store);
        for n in [&a, &b] {
            n.ctx.entities.register_node("x").await.unwrap();
        }
        let mut hb_a = Heartbeat::new(a.ctx.clone());
        let mut hb_b = Heartbeat::new(b.ctx.clone());

        assert!(hb_a.cycle().await.leader);
        assert!(!hb_b.cycle().await.leader);
        assert_eq!(store.lock_holder("cleanup_leader"), Some(a.ctx.node_id.to_string()));

        // A's next cycle releases before competing again, and wins the
        // uncontested lock.
        assert!(hb_a.cycle().await.leader);

        hb_a.finish().await;
        assert!(store.lock_holder("cleanup_leader").is_none());
        assert!(hb_b.cycle().await.leader);
    }

    #[tokio::test]
    async fn leader_sweeps_only_stale_nodes() {
        let store = Arc::new(MemoryStore::new());
        let a = test_node_with(&store, sweep_config());
        let b = test_node_with(&store, sweep_config());
        let c = test_node_with(&store, sweep_config());
        for n in [&a, &b, &c] {
            n.ctx.entities.register_node("proxy").await.unwrap();
        }

        let worker_id = Uuid::new_v4();
        c.ctx.entities.register_worker(worker_id, "10.0.0.9:25565").await.unwrap();
        let session_id = Uuid::new_v4();
        c.ctx.entities.login(session_id, "alex").await.unwrap();
        c.ctx.entities.attach(session_id, worker_id).await.unwrap();

        let b_session = Uuid::new_v4();
        let b_worker = Uuid::new_v4();
        b.ctx.entities.register_worker(b_worker, "10.0.0.8:25565").await.unwrap();
        b.ctx.entities.login(b_session, "sam").await.unwrap();
        b.ctx.entities.attach(b_session, b_worker).await.unwrap();

        // C stops beating; six minutes later A and B are fresh.
        for n in [&a, &b] {
            n.clock.advance(6 * MINUTE);
            n.ctx.beat().await.unwrap();
        }

        let report = Heartbeat::new(a.ctx.clone()).cycle().await;
        assert!(report.leader);
        assert_eq!(report.crashed, vec![c.ctx.node_id]);

        let entities = &a.ctx.entities;
        assert!(entities.try_get::<ClusterNode>(c.ctx.node_id).await.unwrap().is_none());
        assert!(entities.try_get::<Worker>(worker_id).await.unwrap().is_none());
        let session = entities.get::<Session>(session_id).await.unwrap();
        assert_eq!(session.node_id, None);
        assert_eq!(session.worker_id, None);
        assert!(!session.online);
        assert_eq!(session.last_seen, Some(T0 + 6 * MINUTE));

        assert!(entities.try_get::<ClusterNode>(b.ctx.node_id).await.unwrap().is_some());
        assert!(entities.get::<Session>(b_session).await.unwrap().online);
        assert!(entities.try_get::<Worker>(b_worker).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn node_within_threshold_survives() {
        let store = Arc::new(MemoryStore::new());
        let a = test_node_with(&store, sweep_config());
        let b = test_node_with(&store, sweep_config());
        for n in [&a, &b] {
            n.ctx.entities.register_node("proxy").await.unwrap();
        }
        // Exactly at the threshold is not yet stale.
        a.clock.advance(5 * MINUTE);

        assert!(a.ctx.sweep_crashed_nodes().await.unwrap().is_empty());
        assert!(a.ctx.entities.try_get::<ClusterNode>(b.ctx.node_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cycle_counts_sessions_online_without_a_node() {
        let store = Arc::new(MemoryStore::new());
        let node = test_node(&store);
        node.ctx.entities.register_node("a").await.unwrap();
        let session = Uuid::new_v4();
        node.ctx.entities.login(session, "alex").await.unwrap();
        let mut heartbeat = Heartbeat::new(node.ctx.clone());
        assert_eq!(heartbeat.cycle().await.invariant_violations, 0);

        node.ctx
            .entities
            .update::<Session, _>(session, &[fleet_core::SessionField::Online], |s| s.online = true)
            .await
            .unwrap();
        assert_eq!(heartbeat.cycle().await.invariant_violations, 1);
    }
}
