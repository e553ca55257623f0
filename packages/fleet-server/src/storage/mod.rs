//! Cluster store backends and key layout.
//!
//! Records live under `{kind}:{id}` (see [`fleet_core::EntityKind::record_key`]);
//! the username index lives under `username:{lowercase name}` and maps to a
//! session id.

pub mod memory;

pub use memory::MemoryStore;

/// Prefix of the username -> session id index.
pub const USERNAME_PREFIX: &str = "username:";

/// Index key for a username. Lookups are case-insensitive.
#[must_use]
pub fn username_key(username: &str) -> String {
    format!("{USERNAME_PREFIX}{}", username.to_lowercase())
}

/// Single-use reply channel for a remote task call.
#[must_use]
pub fn response_channel(call_id: uuid::Uuid) -> String {
    format!("fleet:task:response:{call_id}")
}

/// Shared channel every node listens on for task requests.
pub const TASK_REQUEST_CHANNEL: &str = "fleet:task:request";
