//! Node startup and ordered shutdown.
//!
//! `FleetNode::start` brings a node up:
//! 1. validate config
//! 2. ping the store (failure is fatal)
//! 3. register the node record
//! 4. subscribe the propagation and task listeners
//! 5. start heartbeat cycles
//!
//! `shutdown` tears it down in the reverse dependency order so that transfer
//! handshakes in flight are answered before anything they need goes away.

use std::sync::Arc;

use fleet_core::ClusterNode;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::context::ClusterContext;
use super::heartbeat::Heartbeat;
use super::lifecycle::HealthState;
use super::propagation::spawn_listeners;
use super::transfer::DrainReport;
use super::types::ClusterError;
use crate::storage::TASK_REQUEST_CHANNEL;
use crate::task::spawn_request_listener;
use crate::worker::PeriodicTask;

/// A running node: its context plus the background tasks it owns.
pub struct FleetNode {
    ctx: Arc<ClusterContext>,
    heartbeat: Option<PeriodicTask>,
    listeners: Vec<JoinHandle<()>>,
}

impl FleetNode {
    /// Starts a node advertising `address` to its peers.
    ///
    /// # Errors
    ///
    /// `Config` for invalid timing settings, `Store` when the store cannot be
    /// reached or subscribed to.
    pub async fn start(ctx: Arc<ClusterContext>, address: &str) -> Result<Self, ClusterError> {
        ctx.config.validate()?;
        ctx.store.ping().await?;

        ctx.entities.register_node(address).await?;
        let warmed = ctx.entities.warm_nodes().await?;

        let mut listeners = spawn_listeners(&ctx).await?;
        let requests = ctx.store.subscribe(TASK_REQUEST_CHANNEL).await?;
        listeners.push(spawn_request_listener(Arc::clone(&ctx), requests));

        let heartbeat = PeriodicTask::spawn(
            Heartbeat::new(Arc::clone(&ctx)),
            ctx.config.heartbeat_interval(),
        );
        ctx.lifecycle.advance(HealthState::Ready);
        info!(node_id = %ctx.node_id, address, peers = warmed.saturating_sub(1), "node ready");

        Ok(Self {
            ctx,
            heartbeat: Some(heartbeat),
            listeners,
        })
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        self.ctx.lifecycle.health_state()
    }

    /// Stops the node. Later steps run even when earlier ones fail; the
    /// first failure is returned.
    ///
    /// # Errors
    ///
    /// Store failures while draining, unregistering or closing.
    pub async fn shutdown(mut self) -> Result<DrainReport, ClusterError> {
        let ctx = Arc::clone(&self.ctx);
        ctx.lifecycle.advance(HealthState::Draining);
        let mut first_error = None;

        // Stopping the heartbeat also releases a cleanup lock held from the
        // last cycle.
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }

        let report = match ctx.drain_sessions().await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "session drain failed");
                first_error.get_or_insert(err);
                DrainReport::default()
            }
        };

        if !ctx.lifecycle.wait_for_drain(ctx.config.drain_timeout()).await {
            warn!(
                in_flight = ctx.lifecycle.in_flight_count(),
                "in-flight tasks still running at shutdown"
            );
        }

        ctx.lifecycle.advance(HealthState::Closing);
        for handle in self.listeners.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "listener task ended abnormally");
            }
        }

        if let Err(err) = ctx.release_leadership().await {
            first_error.get_or_insert(err);
        }
        let retired = match ctx.entities.load_fresh::<ClusterNode>(ctx.node_id).await {
            Ok(Some(node)) => ctx.retire_node(&node).await,
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = retired {
            warn!(error = %err, "could not remove own node record");
            first_error.get_or_insert(err);
        }
        if let Err(err) = ctx.store.close().await {
            first_error.get_or_insert(ClusterError::Store(err));
        }
        ctx.lifecycle.advance(HealthState::Stopped);
        info!(
            node_id = %ctx.node_id,
            transferred = report.transferred.len(),
            disconnected = report.disconnected.len(),
            "node stopped"
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}
