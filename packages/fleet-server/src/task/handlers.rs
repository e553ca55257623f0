//! Built-in task handlers. Each runs on the node that owns the target
//! session.

use async_trait::async_trait;
use fleet_core::{ClusterNode, Session, TaskResult, Worker};
use tracing::{debug, warn};
use uuid::Uuid;

use super::operation::{Task, TaskKind};
use super::registry::{TaskHandler, TaskRegistry};
use crate::cluster::transfer::commit_reply;
use crate::cluster::ClusterContext;

/// Registers a handler for every [`TaskKind`].
pub fn register_builtin(registry: &TaskRegistry) {
    registry.register(TaskKind::KickSession, KickHandler);
    registry.register(TaskKind::MessageSession, MessageHandler);
    registry.register(TaskKind::BanSession, BanHandler);
    registry.register(TaskKind::SwitchWorker, SwitchWorkerHandler);
    registry.register(TaskKind::TransferRequest, TransferProbeHandler);
    registry.register(TaskKind::TransferSession, TransferCommitHandler);
    registry.register(TaskKind::BroadcastMessage, BroadcastHandler);
}

/// Text shown on the disconnect screen of a banned client.
#[must_use]
pub fn ban_screen(reason: &str, permanent: bool, expires_at: Option<u64>) -> String {
    match (permanent, expires_at) {
        (true, _) | (false, None) => format!("You are banned from this network.\nReason: {reason}"),
        (false, Some(at)) => format!(
            "You are temporarily banned from this network.\nReason: {reason}\nExpires: {at}"
        ),
    }
}

/// Fetches a session and checks it is connected to this node.
async fn local_session(ctx: &ClusterContext, session_id: Uuid) -> anyhow::Result<Option<Session>> {
    let Some(session) = ctx.entities.try_get::<Session>(session_id).await? else {
        return Ok(None);
    };
    if session.node_id == Some(ctx.node_id) && session.online {
        Ok(Some(session))
    } else {
        Ok(None)
    }
}

fn not_here(session_id: Uuid) -> TaskResult {
    TaskResult::fail(format!("session {session_id} is not connected to this node"))
}

fn mismatched(expected: TaskKind) -> anyhow::Error {
    anyhow::anyhow!("{expected} handler received a different task")
}

struct KickHandler;

#[async_trait]
impl TaskHandler for KickHandler {
    async fn handle(&self, ctx: &ClusterContext, task: Task) -> anyhow::Result<TaskResult> {
        let Task::KickSession { session_id, reason } = task else {
            return Err(mismatched(TaskKind::KickSession));
        };
        if local_session(ctx, session_id).await?.is_none() {
            return Ok(not_here(session_id));
        }
        ctx.transport.disconnect(session_id, &reason).await?;
        ctx.entities.disconnect(session_id).await?;
        debug!(session_id = %session_id, "session kicked");
        Ok(TaskResult::ok("kicked"))
    }
}

struct MessageHandler;

#[async_trait]
impl TaskHandler for MessageHandler {
    async fn handle(&self, ctx: &ClusterContext, task: Task) -> anyhow::Result<TaskResult> {
        let Task::MessageSession { session_id, message } = task else {
            return Err(mismatched(TaskKind::MessageSession));
        };
        if local_session(ctx, session_id).await?.is_none() {
            return Ok(not_here(session_id));
        }
        ctx.transport.send_message(session_id, &message).await?;
        Ok(TaskResult::ok("delivered"))
    }
}

/// Disconnects a banned session. The ban itself is persisted by the caller
/// before dispatch.
struct BanHandler;

#[async_trait]
impl TaskHandler for BanHandler {
    async fn handle(&self, ctx: &ClusterContext, task: Task) -> anyhow::Result<TaskResult> {
        let Task::BanSession {
            session_id,
            reason,
            permanent,
            expires_at,
        } = task
        else {
            return Err(mismatched(TaskKind::BanSession));
        };
        if local_session(ctx, session_id).await?.is_none() {
            return Ok(not_here(session_id));
        }
        ctx.transport
            .disconnect(session_id, &ban_screen(&reason, permanent, expires_at))
            .await?;
        ctx.entities.disconnect(session_id).await?;
        Ok(TaskResult::ok("banned"))
    }
}

struct SwitchWorkerHandler;

#[async_trait]
impl TaskHandler for SwitchWorkerHandler {
    async fn handle(&self, ctx: &ClusterContext, task: Task) -> anyhow::Result<TaskResult> {
        let Task::SwitchWorker { session_id, worker_id } = task else {
            return Err(mismatched(TaskKind::SwitchWorker));
        };
        if local_session(ctx, session_id).await?.is_none() {
            return Ok(not_here(session_id));
        }
        let Some(worker) = ctx.entities.try_get::<Worker>(worker_id).await? else {
            return Ok(TaskResult::fail(format!("worker {worker_id} not found")));
        };
        if worker.node_id != ctx.node_id {
            return Ok(TaskResult::fail(format!(
                "worker {worker_id} belongs to another node"
            )));
        }
        if !ctx.probe.is_reachable(&worker.address).await {
            return Ok(TaskResult::fail(format!("worker {worker_id} is unreachable")));
        }
        ctx.transport
            .connect_to_worker(session_id, &worker.address)
            .await?;
        ctx.entities.switch_worker(session_id, worker_id).await?;
        Ok(TaskResult::ok(worker_id.to_string()))
    }
}

/// First phase of a transfer, answered by the destination node.
struct TransferProbeHandler;

#[async_trait]
impl TaskHandler for TransferProbeHandler {
    async fn handle(&self, ctx: &ClusterContext, task: Task) -> anyhow::Result<TaskResult> {
        let Task::TransferRequest { worker_id } = task else {
            return Err(mismatched(TaskKind::TransferRequest));
        };
        let status = ctx.probe_worker(worker_id).await?;
        Ok(TaskResult::ok(status.as_str()))
    }
}

struct TransferCommitHandler;

#[async_trait]
impl TaskHandler for TransferCommitHandler {
    async fn handle(&self, ctx: &ClusterContext, task: Task) -> anyhow::Result<TaskResult> {
        let Task::TransferSession {
            session_id,
            destination_node_id,
            worker_id,
        } = task
        else {
            return Err(mismatched(TaskKind::TransferSession));
        };
        if local_session(ctx, session_id).await?.is_none() {
            return Ok(not_here(session_id));
        }
        let outcome = ctx
            .commit_transfer(session_id, destination_node_id, worker_id)
            .await;
        Ok(commit_reply(outcome))
    }
}

/// Sends a message to every session connected to this node. Replies with
/// the number of sessions reached.
struct BroadcastHandler;

#[async_trait]
impl TaskHandler for BroadcastHandler {
    async fn handle(&self, ctx: &ClusterContext, task: Task) -> anyhow::Result<TaskResult> {
        let Task::BroadcastMessage { message } = task else {
            return Err(mismatched(TaskKind::BroadcastMessage));
        };
        let node = ctx.entities.get::<ClusterNode>(ctx.node_id).await?;
        let mut delivered = 0usize;
        for session_id in node.session_ids {
            match ctx.transport.send_message(session_id, &message).await {
                Ok(()) => delivered += 1,
                Err(err) => warn!(session_id = %session_id, error = %err, "broadcast delivery failed"),
            }
        }
        Ok(TaskResult::ok(delivered.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::{test_node, TestNode, TransportEvent};

    struct Attached {
        node: TestNode,
        session: Uuid,
        worker: Uuid,
    }

    async fn attached() -> Attached {
        let store = Arc::new(MemoryStore::new());
        let node = test_node(&store);
        node.ctx.entities.register_node("proxy-a").await.unwrap();
        let worker = Uuid::new_v4();
        node.ctx.entities.register_worker(worker, "lobby").await.unwrap();
        let session = Uuid::new_v4();
        node.ctx.entities.login(session, "alex").await.unwrap();
        node.ctx.entities.attach(session, worker).await.unwrap();
        Attached { node, session, worker }
    }

    #[test]
    fn every_kind_has_a_handler() {
        let registry = TaskRegistry::new();
        register_builtin(&registry);
        assert!(TaskKind::ALL.iter().all(|&kind| registry.is_registered(kind)));
    }

    #[tokio::test]
    async fn kick_disconnects_and_marks_offline() {
        let Attached { node, session, .. } = attached().await;
        let result = node
            .ctx
            .execute_local(Task::KickSession {
                session_id: session,
                reason: "bye".to_string(),
            })
            .await;
        assert_eq!(result, TaskResult::ok("kicked"));
        assert_eq!(
            node.transport.events(),
            vec![TransportEvent::Disconnect {
                session,
                reason: "bye".to_string()
            }]
        );
        assert!(!node.ctx.entities.get::<Session>(session).await.unwrap().online);

        // A second kick finds nothing to do.
        let again = node
            .ctx
            .execute_local(Task::KickSession {
                session_id: session,
                reason: "bye".to_string(),
            })
            .await;
        assert!(!again.ok);
    }

    #[tokio::test]
    async fn ban_shows_ban_screen() {
        let Attached { node, session, .. } = attached().await;
        let result = node
            .ctx
            .execute_local(Task::BanSession {
                session_id: session,
                reason: "cheating".to_string(),
                permanent: true,
                expires_at: None,
            })
            .await;
        assert!(result.ok);
        let events = node.transport.events();
        let [TransportEvent::Disconnect { reason, .. }] = events.as_slice() else {
            panic!("expected one disconnect, got {events:?}");
        };
        assert!(reason.contains("cheating"));
    }

    #[tokio::test]
    async fn switch_worker_checks_reachability() {
        let Attached { node, session, worker } = attached().await;
        let next = Uuid::new_v4();
        node.ctx.entities.register_worker(next, "survival").await.unwrap();
        node.probe.mark_down("survival");

        let refused = node
            .ctx
            .execute_local(Task::SwitchWorker {
                session_id: session,
                worker_id: next,
            })
            .await;
        assert!(!refused.ok);
        assert_eq!(
            node.ctx.entities.get::<Session>(session).await.unwrap().worker_id,
            Some(worker)
        );

        let other = Uuid::new_v4();
        node.ctx.entities.register_worker(other, "creative").await.unwrap();
        let moved = node
            .ctx
            .execute_local(Task::SwitchWorker {
                session_id: session,
                worker_id: other,
            })
            .await;
        assert!(moved.ok);
        assert_eq!(
            node.ctx.entities.get::<Session>(session).await.unwrap().worker_id,
            Some(other)
        );
        assert!(node.transport.events().contains(&TransportEvent::Connect {
            session,
            worker_address: "creative".to_string()
        }));
    }

    #[tokio::test]
    async fn broadcast_reaches_local_sessions() {
        let Attached { node, session, worker } = attached().await;
        let second = Uuid::new_v4();
        node.ctx.entities.login(second, "sam").await.unwrap();
        node.ctx.entities.attach(second, worker).await.unwrap();

        let result = node
            .ctx
            .execute_local(Task::BroadcastMessage {
                message: "restart in 5".to_string(),
            })
            .await;
        assert_eq!(result, TaskResult::ok("2"));
        let messaged: Vec<Uuid> = node
            .transport
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Message { session, .. } => Some(session),
                _ => None,
            })
            .collect();
        assert!(messaged.contains(&session) && messaged.contains(&second));
    }

    #[test]
    fn temporary_ban_screen_names_expiry() {
        assert!(ban_screen("spam", false, Some(42)).contains("Expires: 42"));
        assert!(!ban_screen("spam", true, Some(42)).contains("Expires"));
    }
}
