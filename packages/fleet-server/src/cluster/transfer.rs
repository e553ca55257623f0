//! Load-aware session transfer between nodes.
//!
//! A transfer is two task round-trips:
//! 1. The node owning the session sends `TRANSFER_REQUEST` to the
//!    destination, which answers with a [`TransferStatus`].
//! 2. On `available` or `none_specified` the owner hands the client a
//!    redirect token naming the chosen worker, redirects it to the
//!    destination's address and takes the session offline. A client that
//!    never arrives is left offline rather than owned by a node it has left.
//!
//! When the client arrives, the destination honours the token once, and
//! otherwise picks a random reachable worker.

use fleet_core::{ClusterNode, RedirectToken, Session, TaskResult, TransferStatus, Worker};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::ClusterContext;
use super::types::ClusterError;
use crate::task::Task;

/// Message shown to a client when no worker can take it.
pub const NO_WORKER_MESSAGE: &str = "No server is available right now. Please try again shortly.";
/// Message shown to a client that could not be moved off a stopping node.
pub const DRAIN_FAILED_MESSAGE: &str = "This proxy is restarting. Please reconnect.";

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no destination node available")]
    NoDestination,
    #[error("session {0} is not connected")]
    SessionOffline(Uuid),
    #[error("destination worker not found")]
    WorkerNotFound,
    #[error("destination worker is unreachable")]
    Unreachable,
    #[error("no reachable worker on this node")]
    NoWorkerAvailable,
    #[error("transfer task failed: {info}")]
    Task { info: String },
    #[error("session transport: {0}")]
    Transport(anyhow::Error),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl TransferError {
    fn from_status(status: TransferStatus) -> Self {
        match status {
            TransferStatus::NotFound => TransferError::WorkerNotFound,
            TransferStatus::Unreachable => TransferError::Unreachable,
            TransferStatus::NoneSpecified | TransferStatus::Available => TransferError::Task {
                info: status.as_str().to_string(),
            },
        }
    }

    /// Recovers the error a remote commit reported in its failure info.
    fn from_task_info(info: String) -> Self {
        match TransferStatus::parse(&info) {
            Some(status) if !status.permits_commit() => Self::from_status(status),
            _ => TransferError::Task { info },
        }
    }
}

/// Outcome of draining a node's sessions before shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub transferred: Vec<Uuid>,
    pub disconnected: Vec<Uuid>,
}

impl ClusterContext {
    // -- Load balancing ------------------------------------------------------

    /// The node with the fewest attached sessions, skipping nodes in
    /// maintenance and, if `exclude_self`, this node.
    ///
    /// Session counts come from the entity cache, or from the short-TTL
    /// query cache when the node is not cached here.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn pick_least_loaded(&self, exclude_self: bool) -> Result<Option<ClusterNode>, ClusterError> {
        let mut candidates = Vec::new();
        for &id in self.queries.active_node_ids(self.store.as_ref()).await?.iter() {
            if exclude_self && id == self.node_id {
                continue;
            }
            let load = match self.entities.cached::<ClusterNode>(id).await {
                Some(node) if node.maintenance => continue,
                Some(node) => node.session_ids.len(),
                None => self.queries.node_session_count(self.store.as_ref(), id).await?,
            };
            candidates.push((load, id));
        }
        candidates.sort_unstable();

        for (_, id) in candidates {
            match self.entities.try_get::<ClusterNode>(id).await? {
                Some(node) if !node.maintenance => return Ok(Some(node)),
                _ => {}
            }
        }
        Ok(None)
    }

    // -- Phase 1: probe (runs on the destination) -----------------------------

    /// Answers a transfer probe for `worker_id` on this node.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn probe_worker(&self, worker_id: Option<Uuid>) -> Result<TransferStatus, ClusterError> {
        let Some(worker_id) = worker_id else {
            return Ok(TransferStatus::NoneSpecified);
        };
        let Some(worker) = self.entities.try_get::<Worker>(worker_id).await? else {
            return Ok(TransferStatus::NotFound);
        };
        if self.probe.is_reachable(&worker.address).await {
            Ok(TransferStatus::Available)
        } else {
            Ok(TransferStatus::Unreachable)
        }
    }

    // -- Phase 2: commit (runs on the session's node) --------------------------

    /// Moves a session to `destination_node_id`, optionally onto a specific
    /// worker there. Callable from any node: the commit is routed to the node
    /// the session is attached to.
    ///
    /// # Errors
    ///
    /// `SessionOffline` for detached sessions; otherwise whatever the owning
    /// node's commit reported.
    pub async fn transfer(
        &self,
        session_id: Uuid,
        destination_node_id: Uuid,
        worker_id: Option<Uuid>,
    ) -> Result<TransferStatus, TransferError> {
        let session = self.entities.get::<Session>(session_id).await?;
        let owner = session
            .node_id
            .ok_or(TransferError::SessionOffline(session_id))?;
        let result = self
            .dispatch(
                owner,
                Task::TransferSession {
                    session_id,
                    destination_node_id,
                    worker_id,
                },
            )
            .await;
        if !result.ok {
            return Err(TransferError::from_task_info(result.info));
        }
        TransferStatus::parse(&result.info).ok_or(TransferError::Task { info: result.info })
    }

    /// Runs the handshake for a session attached to this node.
    ///
    /// # Errors
    ///
    /// `NoDestination` for unknown destinations, `WorkerNotFound` and
    /// `Unreachable` from the probe, `Transport` when the client cannot be
    /// redirected, `Cluster` when the redirected session cannot be detached.
    pub async fn commit_transfer(
        &self,
        session_id: Uuid,
        destination_node_id: Uuid,
        worker_id: Option<Uuid>,
    ) -> Result<TransferStatus, TransferError> {
        let destination = self
            .entities
            .try_get::<ClusterNode>(destination_node_id)
            .await?
            .ok_or(TransferError::NoDestination)?;

        let reply = self
            .dispatch(destination_node_id, Task::TransferRequest { worker_id })
            .await;
        if !reply.ok {
            return Err(TransferError::Task { info: reply.info });
        }
        let status = TransferStatus::parse(&reply.info).ok_or_else(|| TransferError::Task {
            info: format!("unexpected probe answer {:?}", reply.info),
        })?;
        if !status.permits_commit() {
            debug!(session_id = %session_id, %status, "destination refused transfer");
            return Err(TransferError::from_status(status));
        }

        if let Some(worker_id) = worker_id {
            let token = RedirectToken {
                worker_id,
                expires_at: self.now().saturating_add(self.config.redirect_token_ttl_ms),
            };
            self.transport
                .store_redirect_token(session_id, &token.encode())
                .await
                .map_err(TransferError::Transport)?;
        }
        self.transport
            .redirect(session_id, &destination.address)
            .await
            .map_err(TransferError::Transport)?;
        // Mid-transfer: no node owns the session until it attaches on arrival.
        self.entities.disconnect(session_id).await?;
        info!(
            session_id = %session_id,
            destination = %destination_node_id,
            worker = ?worker_id,
            "session redirected"
        );
        Ok(status)
    }

    // -- Arrival (runs on the destination) ---------------------------------

    /// Records the redirect token an arriving client presented.
    pub fn receive_redirect_token(&self, session_id: Uuid, token: &[u8]) {
        self.pending_tokens.insert(session_id, token.to_vec());
    }

    /// Chooses the worker an arriving session lands on.
    ///
    /// A pending redirect token is consumed here whether or not it can be
    /// honoured. Without a usable token a random reachable worker of this
    /// node is chosen; with none reachable the client is disconnected.
    ///
    /// # Errors
    ///
    /// `NoWorkerAvailable` after disconnecting the client.
    pub async fn select_initial_worker(&self, session_id: Uuid) -> Result<Worker, TransferError> {
        if let Some((_, raw)) = self.pending_tokens.remove(&session_id) {
            if let Some(worker) = self.redeem_token(session_id, &raw).await? {
                return Ok(worker);
            }
        }

        let node = self.entities.get::<ClusterNode>(self.node_id).await?;
        let mut worker_ids: Vec<Uuid> = node.worker_ids.into_iter().collect();
        worker_ids.shuffle(&mut rand::rng());
        for worker_id in worker_ids {
            let Some(worker) = self.entities.try_get::<Worker>(worker_id).await? else {
                continue;
            };
            if !worker.maintenance && self.probe.is_reachable(&worker.address).await {
                return Ok(worker);
            }
        }

        warn!(session_id = %session_id, "no reachable worker for arriving session");
        self.transport
            .disconnect(session_id, NO_WORKER_MESSAGE)
            .await
            .map_err(TransferError::Transport)?;
        Err(TransferError::NoWorkerAvailable)
    }

    async fn redeem_token(&self, session_id: Uuid, raw: &[u8]) -> Result<Option<Worker>, TransferError> {
        let token = match RedirectToken::decode(raw) {
            Ok(token) => token,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "ignoring redirect token");
                return Ok(None);
            }
        };
        if token.is_expired(self.now()) {
            debug!(session_id = %session_id, "redirect token expired");
            return Ok(None);
        }
        let Some(worker) = self.entities.try_get::<Worker>(token.worker_id).await? else {
            return Ok(None);
        };
        if worker.node_id != self.node_id || !self.probe.is_reachable(&worker.address).await {
            debug!(session_id = %session_id, worker = %worker.id, "redirect token worker unusable");
            return Ok(None);
        }
        Ok(Some(worker))
    }

    // -- Draining ------------------------------------------------------------

    /// Moves every session attached to this node to the least-loaded peer.
    /// Sessions that cannot be moved are disconnected with an explanation.
    ///
    /// # Errors
    ///
    /// Store failures reading this node's record.
    pub async fn drain_sessions(&self) -> Result<DrainReport, ClusterError> {
        let mut report = DrainReport::default();
        let Some(node) = self.entities.try_get::<ClusterNode>(self.node_id).await? else {
            return Ok(report);
        };
        for session_id in node.session_ids {
            let moved = match self.pick_least_loaded(true).await {
                Ok(Some(destination)) => self
                    .commit_transfer(session_id, destination.id, None)
                    .await
                    .map_err(|err| warn!(session_id = %session_id, error = %err, "drain transfer failed"))
                    .is_ok(),
                Ok(None) => false,
                Err(err) => {
                    warn!(error = %err, "no destination for drain");
                    false
                }
            };
            if moved {
                report.transferred.push(session_id);
                continue;
            }
            if let Err(err) = self.transport.disconnect(session_id, DRAIN_FAILED_MESSAGE).await {
                warn!(session_id = %session_id, error = %err, "disconnect during drain failed");
            }
            if let Err(err) = self.entities.disconnect(session_id).await {
                warn!(session_id = %session_id, error = %err, "could not mark drained session offline");
            }
            report.disconnected.push(session_id);
        }
        info!(
            transferred = report.transferred.len(),
            disconnected = report.disconnected.len(),
            "drained sessions"
        );
        Ok(report)
    }
}

/// Maps a commit outcome to the reply of a `TRANSFER_SESSION` task.
pub(crate) fn commit_reply(outcome: Result<TransferStatus, TransferError>) -> TaskResult {
    match outcome {
        Ok(status) => TaskResult::ok(status.as_str()),
        Err(TransferError::WorkerNotFound) => TaskResult::fail(TransferStatus::NotFound.as_str()),
        Err(TransferError::Unreachable) => TaskResult::fail(TransferStatus::Unreachable.as_str()),
        Err(err) => TaskResult::fail(err.to_string()),
    }
}
