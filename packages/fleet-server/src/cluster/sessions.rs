//! Node, worker and session relations.
//!
//! Every operation here keeps both sides of a relation in step: a session's
//! `node_id`/`worker_id` and the matching `session_ids` sets on the node and
//! worker, and a worker's `node_id` and its node's `worker_ids`. Entities are
//! updated one after another, never under nested locks.

use std::time::Duration;

use fleet_core::{
    BanState, ClusterNode, NodeField, Rank, Role, Session, SessionField, Worker, WorkerField,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::entities::EntityManager;
use super::types::ClusterError;
use crate::storage::username_key;

const BAN_FIELDS: [SessionField; 4] = [
    SessionField::Banned,
    SessionField::BanReason,
    SessionField::BanPermanent,
    SessionField::BanExpires,
];

impl EntityManager {
    // -- Nodes and workers -------------------------------------------------

    /// Writes this node's record with a fresh heartbeat.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when a record with this node's id is still stored.
    pub async fn register_node(&self, address: &str) -> Result<ClusterNode, ClusterError> {
        let mut node = ClusterNode::new(self.node_id(), address);
        node.last_heartbeat = Some(self.now());
        let node = self.create(node).await?;
        info!(node_id = %node.id, address, "registered node");
        Ok(node)
    }

    /// Registers a backend worker owned by this node.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` for a duplicate id, `NotFound` when this node is not
    /// registered.
    pub async fn register_worker(&self, id: Uuid, address: &str) -> Result<Worker, ClusterError> {
        let worker = self
            .create(Worker::new(id, address, self.node_id()))
            .await?;
        self.update::<ClusterNode, _>(self.node_id(), &[NodeField::Workers], |node| {
            node.worker_ids.insert(id);
        })
        .await?;
        debug!(worker_id = %id, address, "registered worker");
        Ok(worker)
    }

    /// Deletes a worker after detaching every session attached to it and
    /// removing it from its owning node.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown workers.
    pub async fn delete_worker(&self, worker_id: Uuid) -> Result<(), ClusterError> {
        let worker = self.get::<Worker>(worker_id).await?;
        for session_id in &worker.session_ids {
            match self
                .update::<Session, _>(*session_id, &[SessionField::Worker], |session| {
                    if session.worker_id == Some(worker_id) {
                        session.worker_id = None;
                    }
                })
                .await
            {
                Ok(_) | Err(ClusterError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        match self
            .update::<ClusterNode, _>(worker.node_id, &[NodeField::Workers], |node| {
                node.worker_ids.remove(&worker_id);
            })
            .await
        {
            Ok(_) | Err(ClusterError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        self.delete::<Worker>(worker_id).await?;
        debug!(worker_id = %worker_id, detached = worker.session_ids.len(), "deleted worker");
        Ok(())
    }

    /// # Errors
    ///
    /// `NotFound` for unknown workers.
    pub async fn set_worker_maintenance(
        &self,
        worker_id: Uuid,
        maintenance: bool,
    ) -> Result<Worker, ClusterError> {
        self.update::<Worker, _>(worker_id, &[WorkerField::Maintenance], |worker| {
            worker.maintenance = maintenance;
        })
        .await
    }

    /// # Errors
    ///
    /// `NotFound` for unknown nodes.
    pub async fn set_node_maintenance(
        &self,
        node_id: Uuid,
        maintenance: bool,
    ) -> Result<ClusterNode, ClusterError> {
        self.update::<ClusterNode, _>(node_id, &[NodeField::Maintenance], |node| {
            node.maintenance = maintenance;
        })
        .await
    }

    // -- Session lifecycle ---------------------------------------------------

    /// Loads the session for a joining client, creating it with default role,
    /// rank and empty relations on first ever login. Keeps the username index
    /// current.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn login(&self, session_id: Uuid, username: &str) -> Result<Session, ClusterError> {
        let session = match self.try_get::<Session>(session_id).await? {
            Some(existing) if existing.username == username => existing,
            Some(existing) => {
                let renamed = self
                    .update::<Session, _>(session_id, &[SessionField::Username], |session| {
                        session.username = username.to_string();
                    })
                    .await?;
                let stale = username_key(&existing.username);
                if stale != username_key(username) {
                    self.store().delete(&stale).await?;
                }
                debug!(session_id = %session_id, from = %existing.username, to = username, "username changed");
                renamed
            }
            None => {
                info!(session_id = %session_id, username, "first login");
                match self.create(Session::new(session_id, username)).await {
                    Ok(created) => created,
                    // Lost a creation race with another node.
                    Err(ClusterError::AlreadyExists { .. }) => self.get(session_id).await?,
                    Err(err) => return Err(err),
                }
            }
        };
        self.store()
            .set(&username_key(username), &session_id.to_string())
            .await?;
        Ok(session)
    }

    /// Looks a session up by username, case-insensitively.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn session_by_username(&self, username: &str) -> Result<Option<Session>, ClusterError> {
        let Some(raw) = self.store().get(&username_key(username)).await? else {
            return Ok(None);
        };
        let Ok(session_id) = Uuid::parse_str(&raw) else {
            error!(username, raw = %raw, "corrupt username index entry");
            return Ok(None);
        };
        self.try_get::<Session>(session_id).await
    }

    /// Marks a session online on this node and attached to `worker_id`,
    /// moving it off whatever node and worker it was on before.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown sessions or workers; `Rejected` when the worker
    /// belongs to another node.
    pub async fn attach(&self, session_id: Uuid, worker_id: Uuid) -> Result<Session, ClusterError> {
        let node_id = self.node_id();
        let worker = self.get::<Worker>(worker_id).await?;
        if worker.node_id != node_id {
            return Err(ClusterError::rejected(format!(
                "worker {worker_id} belongs to node {}",
                worker.node_id
            )));
        }
        let previous = self.get::<Session>(session_id).await?;
        if let Some(old_node) = previous.node_id.filter(|&n| n != node_id) {
            self.unlink_from_node(old_node, session_id).await?;
        }
        if let Some(old_worker) = previous.worker_id.filter(|&w| w != worker_id) {
            self.unlink_from_worker(old_worker, session_id).await?;
        }

        self.update::<ClusterNode, _>(node_id, &[NodeField::Sessions], |node| {
            node.session_ids.insert(session_id);
        })
        .await?;
        self.update::<Worker, _>(worker_id, &[WorkerField::Sessions], |worker| {
            worker.session_ids.insert(session_id);
        })
        .await?;
        let session = self
            .update::<Session, _>(
                session_id,
                &[SessionField::Node, SessionField::Worker, SessionField::Online],
                |session| {
                    session.node_id = Some(node_id);
                    session.worker_id = Some(worker_id);
                    session.online = true;
                },
            )
            .await?;
        self.check_session_invariants(&session);
        Ok(session)
    }

    /// Moves an attached session to another worker of this node.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown sessions or workers; `Rejected` when the
    /// session is not attached here or the worker belongs to another node.
    pub async fn switch_worker(&self, session_id: Uuid, worker_id: Uuid) -> Result<Session, ClusterError> {
        let session = self.get::<Session>(session_id).await?;
        if session.node_id != Some(self.node_id()) {
            return Err(ClusterError::rejected(format!(
                "session {session_id} is not attached to this node"
            )));
        }
        if session.worker_id == Some(worker_id) {
            return Ok(session);
        }
        self.attach(session_id, worker_id).await
    }

    /// Marks a session offline when it leaves this node.
    ///
    /// Returns `false` without touching anything when the session has already
    /// been attached elsewhere, which is the normal case for the source node
    /// of a completed transfer.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown sessions.
    pub async fn disconnect(&self, session_id: Uuid) -> Result<bool, ClusterError> {
        let node_id = self.node_id();
        let session = self.get::<Session>(session_id).await?;
        if session.node_id != Some(node_id) {
            return Ok(false);
        }
        if let Some(worker_id) = session.worker_id {
            self.unlink_from_worker(worker_id, session_id).await?;
        }
        self.unlink_from_node(node_id, session_id).await?;
        self.mark_offline(session_id).await?;
        Ok(true)
    }

    /// Detaches a session from any node and worker and stamps last-seen.
    pub(crate) async fn mark_offline(&self, session_id: Uuid) -> Result<Session, ClusterError> {
        let now = self.now();
        self.update::<Session, _>(
            session_id,
            &[
                SessionField::Node,
                SessionField::Worker,
                SessionField::Online,
                SessionField::LastSeen,
            ],
            |session| {
                session.node_id = None;
                session.worker_id = None;
                session.online = false;
                session.last_seen = Some(now);
            },
        )
        .await
    }

    async fn unlink_from_node(&self, node_id: Uuid, session_id: Uuid) -> Result<(), ClusterError> {
        match self
            .update::<ClusterNode, _>(node_id, &[NodeField::Sessions], |node| {
                node.session_ids.remove(&session_id);
            })
            .await
        {
            Ok(_) | Err(ClusterError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn unlink_from_worker(&self, worker_id: Uuid, session_id: Uuid) -> Result<(), ClusterError> {
        match self
            .update::<Worker, _>(worker_id, &[WorkerField::Sessions], |worker| {
                worker.session_ids.remove(&session_id);
            })
            .await
        {
            Ok(_) | Err(ClusterError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    // -- Session attributes ------------------------------------------------

    /// # Errors
    ///
    /// `NotFound` for unknown sessions.
    pub async fn set_role(&self, session_id: Uuid, role: Role) -> Result<Session, ClusterError> {
        self.update::<Session, _>(session_id, &[SessionField::Role], |s| s.role = role)
            .await
    }

    /// # Errors
    ///
    /// `NotFound` for unknown sessions.
    pub async fn set_rank(&self, session_id: Uuid, rank: Rank) -> Result<Session, ClusterError> {
        self.update::<Session, _>(session_id, &[SessionField::Rank], |s| s.rank = rank)
            .await
    }

    /// Sets or clears (`None` or blank) the display nickname.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown sessions.
    pub async fn set_nickname(
        &self,
        session_id: Uuid,
        nickname: Option<&str>,
    ) -> Result<Session, ClusterError> {
        let nickname = nickname
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        self.update::<Session, _>(session_id, &[SessionField::Nickname], |s| {
            s.nickname = nickname;
        })
        .await
    }

    /// # Errors
    ///
    /// `NotFound` for unknown sessions.
    pub async fn set_vanished(&self, session_id: Uuid, vanished: bool) -> Result<Session, ClusterError> {
        self.update::<Session, _>(session_id, &[SessionField::Vanished], |s| {
            s.vanished = vanished;
        })
        .await
    }

    // -- Bans --------------------------------------------------------------

    /// Records a ban. Temporary bans need a `duration` and expire at
    /// `now + duration`.
    ///
    /// # Errors
    ///
    /// `Rejected` for a temporary ban without a duration; `NotFound` for
    /// unknown sessions.
    pub async fn ban(
        &self,
        session_id: Uuid,
        reason: &str,
        permanent: bool,
        duration: Option<Duration>,
    ) -> Result<Session, ClusterError> {
        let expires_at = if permanent {
            None
        } else {
            let duration =
                duration.ok_or_else(|| ClusterError::rejected("temporary ban needs a duration"))?;
            let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            Some(self.now().saturating_add(millis))
        };
        let ban = BanState {
            banned: true,
            reason: Some(reason.to_string()).filter(|r| !r.is_empty()),
            permanent,
            expires_at,
        };
        info!(session_id = %session_id, permanent, ?expires_at, "banning session");
        self.update::<Session, _>(session_id, &BAN_FIELDS, |s| s.ban = ban)
            .await
    }

    /// # Errors
    ///
    /// `NotFound` for unknown sessions.
    pub async fn unban(&self, session_id: Uuid) -> Result<Session, ClusterError> {
        self.update::<Session, _>(session_id, &BAN_FIELDS, |s| s.ban = BanState::default())
            .await
    }

    /// Whether the session's ban is in force now. Expired temporary bans
    /// count as lifted.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown sessions.
    pub async fn is_banned(&self, session_id: Uuid) -> Result<bool, ClusterError> {
        let session = self.get::<Session>(session_id).await?;
        Ok(session.ban.is_active(self.now()))
    }

    // -- Invariants ----------------------------------------------------------

    /// Logs an online session without a node. No repair is attempted; the
    /// crash sweep is what eventually clears such sessions.
    pub fn check_session_invariants(&self, session: &Session) -> bool {
        match session.invariant_violation() {
            Some(violation) => {
                error!(
                    session_id = %session.id,
                    error = %ClusterError::InvariantViolation(violation),
                    "session invariant violated"
                );
                false
            }
            None => true,
        }
    }

    /// Checks every cached session. Returns the number of violations.
    pub async fn check_cached_sessions(&self) -> usize {
        let mut violations = 0;
        for id in self.cached_ids::<Session>() {
            if let Some(session) = self.cached::<Session>(id).await {
                if !self.check_session_invariants(&session) {
                    violations += 1;
                }
            }
        }
        violations
    }
}
