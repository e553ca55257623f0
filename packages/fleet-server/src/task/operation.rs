//! Task variants and the request envelope carried on the task channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminator of a [`Task`], used as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    KickSession,
    MessageSession,
    BanSession,
    SwitchWorker,
    TransferRequest,
    TransferSession,
    BroadcastMessage,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::KickSession,
        TaskKind::MessageSession,
        TaskKind::BanSession,
        TaskKind::SwitchWorker,
        TaskKind::TransferRequest,
        TaskKind::TransferSession,
        TaskKind::BroadcastMessage,
    ];

    /// Wire name, matching the `"type"` field of a serialized task.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::KickSession => "KICK_SESSION",
            TaskKind::MessageSession => "MESSAGE_SESSION",
            TaskKind::BanSession => "BAN_SESSION",
            TaskKind::SwitchWorker => "SWITCH_WORKER",
            TaskKind::TransferRequest => "TRANSFER_REQUEST",
            TaskKind::TransferSession => "TRANSFER_SESSION",
            TaskKind::BroadcastMessage => "BROADCAST_MESSAGE",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation executed on the node that owns its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Task {
    /// Disconnect a session with a reason.
    KickSession { session_id: Uuid, reason: String },
    /// Deliver a message to one session.
    MessageSession { session_id: Uuid, message: String },
    /// Disconnect a session with a ban screen. The ban itself is already
    /// persisted by the caller.
    BanSession {
        session_id: Uuid,
        reason: String,
        permanent: bool,
        /// Absolute expiry in epoch millis for temporary bans.
        expires_at: Option<u64>,
    },
    /// Move a session to another worker of the same node.
    SwitchWorker { session_id: Uuid, worker_id: Uuid },
    /// Transfer probe, executed on the destination node.
    TransferRequest { worker_id: Option<Uuid> },
    /// Transfer commit, executed on the node the session is attached to.
    TransferSession {
        session_id: Uuid,
        destination_node_id: Uuid,
        worker_id: Option<Uuid>,
    },
    /// Deliver a message to every session attached to the target node.
    BroadcastMessage { message: String },
}

impl Task {
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::KickSession { .. } => TaskKind::KickSession,
            Task::MessageSession { .. } => TaskKind::MessageSession,
            Task::BanSession { .. } => TaskKind::BanSession,
            Task::SwitchWorker { .. } => TaskKind::SwitchWorker,
            Task::TransferRequest { .. } => TaskKind::TransferRequest,
            Task::TransferSession { .. } => TaskKind::TransferSession,
            Task::BroadcastMessage { .. } => TaskKind::BroadcastMessage,
        }
    }
}

/// A task addressed to one node, with the channel its reply goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub target_node_id: Uuid,
    pub response_channel: String,
    #[serde(flatten)]
    pub task: Task,
}

impl TaskRequest {
    /// # Errors
    ///
    /// Serialization failures.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// # Errors
    ///
    /// Payloads that are not JSON, carry an unknown `"type"`, or miss fields.
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
