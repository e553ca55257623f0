//! Session-targeted helpers that route a task to the node the session is
//! connected to. Callable from any node.

use std::time::Duration;

use fleet_core::{Session, TaskResult};
use futures_util::future::join_all;
use tracing::info;
use uuid::Uuid;

use super::operation::Task;
use crate::cluster::{ClusterContext, ClusterError};

impl ClusterContext {
    /// Owner of a connected session, or a failed result explaining why
    /// there is none.
    async fn owner_of(&self, session_id: Uuid) -> Result<Uuid, TaskResult> {
        match self.entities.try_get::<Session>(session_id).await {
            Ok(Some(Session {
                node_id: Some(node_id),
                online: true,
                ..
            })) => Ok(node_id),
            Ok(Some(_)) => Err(TaskResult::fail(format!("session {session_id} is offline"))),
            Ok(None) => Err(TaskResult::fail(format!("session {session_id} not found"))),
            Err(err) => Err(TaskResult::fail(err.to_string())),
        }
    }

    async fn route(&self, session_id: Uuid, task: Task) -> TaskResult {
        match self.owner_of(session_id).await {
            Ok(owner) => self.dispatch(owner, task).await,
            Err(result) => result,
        }
    }

    pub async fn kick(&self, session_id: Uuid, reason: &str) -> TaskResult {
        self.route(
            session_id,
            Task::KickSession {
                session_id,
                reason: reason.to_string(),
            },
        )
        .await
    }

    pub async fn message(&self, session_id: Uuid, message: &str) -> TaskResult {
        self.route(
            session_id,
            Task::MessageSession {
                session_id,
                message: message.to_string(),
            },
        )
        .await
    }

    /// Persists a ban, then disconnects the session if it is online.
    ///
    /// # Errors
    ///
    /// Failures recording the ban. Failing to reach the session's node only
    /// shows in the returned result: the ban is in force either way.
    pub async fn ban(
        &self,
        session_id: Uuid,
        reason: &str,
        permanent: bool,
        duration: Option<Duration>,
    ) -> Result<TaskResult, ClusterError> {
        let session = self
            .entities
            .ban(session_id, reason, permanent, duration)
            .await?;
        info!(session_id = %session_id, online = session.online, "ban recorded");
        let (Some(owner), true) = (session.node_id, session.online) else {
            return Ok(TaskResult::ok("banned offline"));
        };
        Ok(self
            .dispatch(
                owner,
                Task::BanSession {
                    session_id,
                    reason: reason.to_string(),
                    permanent,
                    expires_at: session.ban.expires_at,
                },
            )
            .await)
    }

    pub async fn switch_worker(&self, session_id: Uuid, worker_id: Uuid) -> TaskResult {
        self.route(session_id, Task::SwitchWorker { session_id, worker_id })
            .await
    }

    /// Sends `message` to every session in the cluster. Returns how many
    /// sessions each reachable node delivered to, summed.
    ///
    /// # Errors
    ///
    /// Store failures listing nodes.
    pub async fn broadcast(&self, message: &str) -> Result<usize, ClusterError> {
        let nodes = self.queries.active_node_ids(self.store.as_ref()).await?;
        let replies = join_all(nodes.iter().map(|&node_id| {
            self.dispatch(
                node_id,
                Task::BroadcastMessage {
                    message: message.to_string(),
                },
            )
        }))
        .await;
        Ok(replies
            .into_iter()
            .filter(|reply| reply.ok)
            .filter_map(|reply| reply.info.parse::<usize>().ok())
            .sum())
    }
}
