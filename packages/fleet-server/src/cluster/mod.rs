//! Cluster state replication and coordination.
//!
//! Provides the per-node entity cache with store-first writes, change
//! propagation between peers, session and social-graph operations, the
//! heartbeat with cleanup-leader election, the transfer coordinator and
//! node lifecycle.

pub mod context;
pub mod entities;
pub mod heartbeat;
pub mod lifecycle;
pub mod node;
pub mod propagation;
pub mod query_cache;
pub mod sessions;
pub mod social;
pub mod transfer;
pub mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use context::ClusterContext;
pub use entities::{DanglingRefs, EntityManager, Replicated};
pub use heartbeat::{CycleReport, Heartbeat};
pub use lifecycle::{HealthState, InFlightGuard, NodeLifecycle};
pub use node::FleetNode;
pub use propagation::{apply_notice, spawn_listeners, NoticeOutcome};
pub use query_cache::QueryCache;
pub use transfer::{DrainReport, TransferError};
pub use types::{ClusterConfig, ClusterError, ConfigError};

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
