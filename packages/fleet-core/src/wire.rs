//! Text wire formats shared by every node.
//!
//! - Propagation notice: `"{origin}_{entity}_{field}"`, one per field write.
//!   The payload carries no value; receivers re-read the field from the store.
//! - Task reply: `"{true|false}_{info}"`, published once on a per-call channel.
//! - Redirect token: the destination worker id in textual form plus an
//!   expiry, carried by the client across a reconnect.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityKind;

/// Reserved field key announcing that an entity was created.
pub const FIELD_NEW: &str = "new";
/// Reserved field key announcing that an entity was removed.
pub const FIELD_DELETE: &str = "delete";

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

/// What a propagation notice announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    Created,
    Deleted,
    /// A single field changed; the string is the raw field key, validated by
    /// the receiver against the kind's allowed keys.
    Field(String),
}

impl UpdateKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            UpdateKind::Created => FIELD_NEW,
            UpdateKind::Deleted => FIELD_DELETE,
            UpdateKind::Field(key) => key,
        }
    }
}

/// Error returned for payloads that do not follow a wire format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {format} payload: {payload:?}")]
pub struct MalformedPayload {
    pub format: &'static str,
    pub payload: String,
}

fn malformed(format: &'static str, payload: &str) -> MalformedPayload {
    MalformedPayload {
        format,
        payload: payload.to_string(),
    }
}

/// A field-level change notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationMessage {
    pub origin: Uuid,
    pub entity_id: Uuid,
    pub update: UpdateKind,
}

impl PropagationMessage {
    #[must_use]
    pub fn field(origin: Uuid, entity_id: Uuid, key: &str) -> Self {
        Self {
            origin,
            entity_id,
            update: UpdateKind::Field(key.to_string()),
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}_{}_{}", self.origin, self.entity_id, self.update.as_str())
    }

    /// Parses a notice. Field keys may themselves contain `_`; UUIDs never do.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedPayload`] when the ids do not parse or the key is empty.
    pub fn parse(payload: &str) -> Result<Self, MalformedPayload> {
        let mut parts = payload.splitn(3, '_');
        let (Some(origin), Some(entity), Some(key)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("propagation", payload));
        };
        let origin = Uuid::parse_str(origin).map_err(|_| malformed("propagation", payload))?;
        let entity_id = Uuid::parse_str(entity).map_err(|_| malformed("propagation", payload))?;
        let update = match key {
            "" => return Err(malformed("propagation", payload)),
            FIELD_NEW => UpdateKind::Created,
            FIELD_DELETE => UpdateKind::Deleted,
            other => UpdateKind::Field(other.to_string()),
        };
        Ok(Self {
            origin,
            entity_id,
            update,
        })
    }
}

/// Returns `true` when `key` is a valid update key for `kind`.
#[must_use]
pub fn is_allowed_update_key(kind: EntityKind, key: &str) -> bool {
    key == FIELD_NEW || key == FIELD_DELETE || kind.allowed_field_keys().contains(&key)
}

// ---------------------------------------------------------------------------
// Task reply
// ---------------------------------------------------------------------------

/// Outcome of a task, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub ok: bool,
    pub info: String,
}

impl TaskResult {
    #[must_use]
    pub fn ok(info: impl Into<String>) -> Self {
        Self {
            ok: true,
            info: info.into(),
        }
    }

    #[must_use]
    pub fn fail(info: impl Into<String>) -> Self {
        Self {
            ok: false,
            info: info.into(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}_{}", self.ok, self.info)
    }

    /// Parses `"{true|false}_{info}"`. The info part may contain `_`.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedPayload`] when the flag is missing or not a bool.
    pub fn parse(payload: &str) -> Result<Self, MalformedPayload> {
        let (flag, info) = payload
            .split_once('_')
            .ok_or_else(|| malformed("task reply", payload))?;
        let ok = match flag {
            "true" => true,
            "false" => false,
            _ => return Err(malformed("task reply", payload)),
        };
        Ok(Self {
            ok,
            info: info.to_string(),
        })
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.ok { "ok" } else { "failed" };
        write!(f, "{status}: {}", self.info)
    }
}

// ---------------------------------------------------------------------------
// Transfer status
// ---------------------------------------------------------------------------

/// Answer of a destination node to a transfer probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// No destination worker was requested; the destination picks one.
    NoneSpecified,
    NotFound,
    /// The worker exists but its liveness probe failed.
    Unreachable,
    Available,
}

impl TransferStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::NoneSpecified => "none_specified",
            TransferStatus::NotFound => "not_found",
            TransferStatus::Unreachable => "unreachable",
            TransferStatus::Available => "available",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none_specified" => Some(TransferStatus::NoneSpecified),
            "not_found" => Some(TransferStatus::NotFound),
            "unreachable" => Some(TransferStatus::Unreachable),
            "available" => Some(TransferStatus::Available),
            _ => None,
        }
    }

    /// Whether the initiator may go ahead with the redirect.
    #[must_use]
    pub fn permits_commit(self) -> bool {
        matches!(self, TransferStatus::NoneSpecified | TransferStatus::Available)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Redirect token
// ---------------------------------------------------------------------------

/// One-shot hint naming the worker a transferring session should land on.
///
/// Encoded as `"{worker_id}@{expires_at_ms}"` and handed to the client as
/// opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectToken {
    pub worker_id: Uuid,
    pub expires_at: u64,
}

impl RedirectToken {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        format!("{}@{}", self.worker_id, self.expires_at).into_bytes()
    }

    /// # Errors
    ///
    /// Returns [`MalformedPayload`] for bytes that are not a token.
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedPayload> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| malformed("redirect token", &String::from_utf8_lossy(bytes)))?;
        let (worker, expires) = text
            .split_once('@')
            .ok_or_else(|| malformed("redirect token", text))?;
        Ok(Self {
            worker_id: Uuid::parse_str(worker).map_err(|_| malformed("redirect token", text))?,
            expires_at: expires
                .parse()
                .map_err(|_| malformed("redirect token", text))?,
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
