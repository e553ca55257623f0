use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Shared cluster store: scalars, field records, pub/sub, and an advisory lock.
///
/// The only state shared between nodes. Implementations must tolerate
/// concurrent use from every component of a node.
/// Implementations: in-memory (tests, single-node), Redis-like services (external).
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Round-trip check used at startup. Failure is fatal for the node.
    async fn ping(&self) -> anyhow::Result<()>;

    /// Read a scalar value.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Write a scalar value.
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Delete a scalar or a record.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Read one field of a record.
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>>;

    /// Write one field of a record, creating the record if needed.
    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()>;

    /// Write several fields of a record at once.
    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> anyhow::Result<()>;

    /// Write several fields of a record only if the record exists. Returns
    /// `false`, writing nothing, when it does not.
    async fn hset_existing(&self, key: &str, fields: &[(String, String)]) -> anyhow::Result<bool>;

    /// Read a whole record. `None` when the record does not exist.
    async fn hgetall(&self, key: &str) -> anyhow::Result<Option<HashMap<String, String>>>;

    /// List every key starting with `prefix`.
    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Publish a payload to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()>;

    /// Subscribe to `channel`. Dropping the subscription unsubscribes.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription>;

    /// Try to take the advisory lock `key` for `owner` with a TTL.
    /// Returns `false` when another owner holds an unexpired lock.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Release `key` if, and only if, `owner` holds it.
    async fn unlock(&self, key: &str, owner: &str) -> anyhow::Result<()>;

    /// Release resources and close connections.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Receiving end of a pub/sub subscription.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    #[must_use]
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
            on_drop: None,
        }
    }

    /// Runs `unsubscribe` when the subscription is dropped, so the store can
    /// forget the subscriber without waiting for the next publish.
    #[must_use]
    pub fn on_drop(mut self, unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Box::new(unsubscribe));
        self
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the store side has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.on_drop.take() {
            unsubscribe();
        }
    }
}

/// The proxy runtime's handle on live client connections.
///
/// Only the node a session is connected to can act on it; everything else
/// goes through task dispatch first.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Deliver a chat/system message to the client.
    async fn send_message(&self, session_id: Uuid, message: &str) -> anyhow::Result<()>;

    /// Close the client connection with a reason shown to the user.
    async fn disconnect(&self, session_id: Uuid, reason: &str) -> anyhow::Result<()>;

    /// Route the client's connection to a backend worker on this node.
    async fn connect_to_worker(&self, session_id: Uuid, worker_address: &str)
        -> anyhow::Result<()>;

    /// Hand the client an opaque token it echoes back on its next connection.
    async fn store_redirect_token(&self, session_id: Uuid, token: &[u8]) -> anyhow::Result<()>;

    /// Tell the client to reconnect to another proxy node.
    async fn redirect(&self, session_id: Uuid, node_address: &str) -> anyhow::Result<()>;
}

/// Liveness probe for backend workers.
#[async_trait]
pub trait WorkerProbe: Send + Sync {
    /// Returns `true` when the worker at `address` accepts connections.
    async fn is_reachable(&self, address: &str) -> bool;
}

/// Probe that attempts a TCP connect bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TcpWorkerProbe {
    timeout: Duration,
}

impl TcpWorkerProbe {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl WorkerProbe for TcpWorkerProbe {
    async fn is_reachable(&self, address: &str) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }
}
