//! Cluster configuration and error types.

use std::time::Duration;

use fleet_core::{EntityError, EntityKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by cache, relation and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: EntityKind, id: Uuid },
    #[error(transparent)]
    InvalidField(#[from] EntityError),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("{0}")]
    Rejected(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClusterError {
    pub(crate) fn not_found(kind: EntityKind, id: Uuid) -> Self {
        ClusterError::NotFound { kind, id }
    }

    pub(crate) fn rejected(reason: impl Into<String>) -> Self {
        ClusterError::Rejected(reason.into())
    }
}

/// Invalid timing relationships in [`ClusterConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeatInterval,
    #[error("staleness threshold must span at least 2 heartbeat intervals, got {0}")]
    StalenessTooShort(u32),
    #[error("leader lock ttl ({lock_ttl_ms}ms) must be shorter than the heartbeat interval ({interval_ms}ms)")]
    LockOutlivesInterval { lock_ttl_ms: u64, interval_ms: u64 },
    #[error("task timeout must be non-zero")]
    ZeroTaskTimeout,
    #[error("query cache ttl must be between 1s and 10s, got {0}ms")]
    QueryCacheTtlOutOfRange(u64),
}

// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

/// Timing and sizing knobs for one node.
///
/// The crash-detection threshold is derived, never configured directly:
/// `heartbeat_interval_ms * staleness_intervals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub heartbeat_interval_ms: u64,
    pub staleness_intervals: u32,
    pub leader_lock_key: String,
    pub leader_lock_ttl_ms: u64,
    pub task_timeout_ms: u64,
    pub query_cache_ttl_ms: u64,
    pub query_cache_capacity: usize,
    pub probe_timeout_ms: u64,
    pub redirect_token_ttl_ms: u64,
    /// Upper bound on how long shutdown waits for in-flight task handlers.
    pub drain_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 180_000,
            staleness_intervals: 2,
            leader_lock_key: "cleanup_leader".to_string(),
            leader_lock_ttl_ms: 30_000,
            task_timeout_ms: 2_000,
            query_cache_ttl_ms: 5_000,
            query_cache_capacity: 64,
            probe_timeout_ms: 1_000,
            redirect_token_ttl_ms: 30_000,
            drain_timeout_ms: 10_000,
        }
    }
}

impl ClusterConfig {
    /// Checks the relationships between the timing constants.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.staleness_intervals < 2 {
            return Err(ConfigError::StalenessTooShort(self.staleness_intervals));
        }
        if self.leader_lock_ttl_ms >= self.heartbeat_interval_ms {
            return Err(ConfigError::LockOutlivesInterval {
                lock_ttl_ms: self.leader_lock_ttl_ms,
                interval_ms: self.heartbeat_interval_ms,
            });
        }
        if self.task_timeout_ms == 0 {
            return Err(ConfigError::ZeroTaskTimeout);
        }
        if !(1_000..=10_000).contains(&self.query_cache_ttl_ms) {
            return Err(ConfigError::QueryCacheTtlOutOfRange(self.query_cache_ttl_ms));
        }
        Ok(())
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Age after which a node's heartbeat marks it as crashed.
    #[must_use]
    pub fn staleness_threshold_ms(&self) -> u64 {
        self.heartbeat_interval_ms
            .saturating_mul(u64::from(self.staleness_intervals))
    }

    #[must_use]
    pub fn leader_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.leader_lock_ttl_ms)
    }

    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    #[must_use]
    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.query_cache_ttl_ms)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
