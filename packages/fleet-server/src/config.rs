//! Command-line and environment configuration for a node process.

use clap::Parser;
use uuid::Uuid;

use crate::cluster::{ClusterConfig, ConfigError};

/// Options for one proxy node. Every flag falls back to a `FLEET_*`
/// environment variable, then to the [`ClusterConfig`] default.
#[derive(Debug, Clone, Parser)]
#[command(name = "test-node", about = "Runs one fleet node against an in-process store")]
pub struct NodeArgs {
    /// Node id. A random one is generated when absent.
    #[arg(long, env = "FLEET_NODE_ID")]
    pub node_id: Option<Uuid>,

    /// Address clients are redirected to when transferred onto this node.
    #[arg(long, env = "FLEET_ADDRESS", default_value = "127.0.0.1:25577")]
    pub address: String,

    /// Backend workers to register, as `address` entries.
    #[arg(long = "worker", env = "FLEET_WORKERS", value_delimiter = ',')]
    pub workers: Vec<String>,

    #[arg(long, env = "FLEET_HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: Option<u64>,

    /// Missed heartbeat intervals before a node is declared crashed.
    #[arg(long, env = "FLEET_STALENESS_INTERVALS")]
    pub staleness_intervals: Option<u32>,

    #[arg(long, env = "FLEET_LEADER_LOCK_TTL_MS")]
    pub leader_lock_ttl_ms: Option<u64>,

    #[arg(long, env = "FLEET_TASK_TIMEOUT_MS")]
    pub task_timeout_ms: Option<u64>,

    #[arg(long, env = "FLEET_QUERY_CACHE_TTL_MS")]
    pub query_cache_ttl_ms: Option<u64>,

    #[arg(long, env = "FLEET_PROBE_TIMEOUT_MS")]
    pub probe_timeout_ms: Option<u64>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "FLEET_JSON_LOGS")]
    pub json_logs: bool,
}

impl NodeArgs {
    /// Applies the overrides on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns the first violated timing constraint.
    pub fn cluster_config(&self) -> Result<ClusterConfig, ConfigError> {
        let defaults = ClusterConfig::default();
        let config = ClusterConfig {
            heartbeat_interval_ms: self
                .heartbeat_interval_ms
                .unwrap_or(defaults.heartbeat_interval_ms),
            staleness_intervals: self
                .staleness_intervals
                .unwrap_or(defaults.staleness_intervals),
            leader_lock_ttl_ms: self.leader_lock_ttl_ms.unwrap_or(defaults.leader_lock_ttl_ms),
            task_timeout_ms: self.task_timeout_ms.unwrap_or(defaults.task_timeout_ms),
            query_cache_ttl_ms: self.query_cache_ttl_ms.unwrap_or(defaults.query_cache_ttl_ms),
            probe_timeout_ms: self.probe_timeout_ms.unwrap_or(defaults.probe_timeout_ms),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn node_id(&self) -> Uuid {
        self.node_id.unwrap_or_else(Uuid::new_v4)
    }
}
