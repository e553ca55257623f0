//! In-memory [`ClusterStore`] backed by [`DashMap`].
//!
//! Several nodes sharing one `MemoryStore` behave like a cluster sharing one
//! store service: records, pub/sub fan-out and the advisory lock are all
//! visible to every node. [`MemoryStore::connect`] opens a second connection
//! to the same keyspace, so one node closing its connection does not affect
//! the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::traits::{ClusterStore, Subscription};

struct LockEntry {
    owner: String,
    expires_at: Instant,
}

struct Subscriber {
    id: u64,
    connection: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Keyspace {
    scalars: DashMap<String, String>,
    records: DashMap<String, HashMap<String, String>>,
    channels: DashMap<String, Vec<Subscriber>>,
    locks: Mutex<HashMap<String, LockEntry>>,
    published: AtomicU64,
    connections: AtomicU64,
    subscribers: AtomicU64,
}

impl Keyspace {
    fn unsubscribe(&self, channel: &str, subscriber: u64) {
        if let Some(mut subs) = self.channels.get_mut(channel) {
            subs.retain(|s| s.id != subscriber);
        }
        self.channels.remove_if(channel, |_, subs| subs.is_empty());
    }
}

/// Process-local store connection. Lock expiry follows tokio's clock, so
/// paused-time tests can expire locks deterministically.
pub struct MemoryStore {
    keyspace: Arc<Keyspace>,
    connection: u64,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty keyspace and a first connection to it.
    #[must_use]
    pub fn new() -> Self {
        Self::attach(Arc::new(Keyspace::default()))
    }

    fn attach(keyspace: Arc<Keyspace>) -> Self {
        let connection = keyspace.connections.fetch_add(1, Ordering::Relaxed);
        Self {
            keyspace,
            connection,
            closed: AtomicBool::new(false),
        }
    }

    /// Opens another connection to the same keyspace.
    #[must_use]
    pub fn connect(&self) -> Self {
        Self::attach(Arc::clone(&self.keyspace))
    }

    /// Total number of `publish` calls served so far, across connections.
    #[must_use]
    pub fn publish_count(&self) -> u64 {
        self.keyspace.published.load(Ordering::Relaxed)
    }

    /// Number of live subscribers on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.keyspace
            .channels
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }

    /// Number of channels with at least one subscriber.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.keyspace.channels.len()
    }

    /// Current holder of lock `key`, ignoring expired entries.
    #[must_use]
    pub fn lock_holder(&self, key: &str) -> Option<String> {
        let locks = self.keyspace.locks.lock();
        locks
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.owner.clone())
    }

    /// Whether a record or scalar is stored under `key`. Works on closed
    /// connections too.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.keyspace.records.contains_key(key) || self.keyspace.scalars.contains_key(key)
    }

    fn ensure_open(&self) -> anyhow::Result<&Keyspace> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("store connection closed");
        }
        Ok(&self.keyspace)
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        self.ensure_open().map(|_| ())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let ks = self.ensure_open()?;
        Ok(ks.scalars.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let ks = self.ensure_open()?;
        ks.scalars.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let ks = self.ensure_open()?;
        ks.scalars.remove(key);
        ks.records.remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        let ks = self.ensure_open()?;
        Ok(ks
            .records
            .get(key)
            .and_then(|record| record.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()> {
        let ks = self.ensure_open()?;
        ks.records
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> anyhow::Result<()> {
        let ks = self.ensure_open()?;
        let mut record = ks.records.entry(key.to_string()).or_default();
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hset_existing(&self, key: &str, fields: &[(String, String)]) -> anyhow::Result<bool> {
        let ks = self.ensure_open()?;
        let Some(mut record) = ks.records.get_mut(key) else {
            return Ok(false);
        };
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
        Ok(true)
    }

    async fn hgetall(&self, key: &str) -> anyhow::Result<Option<HashMap<String, String>>> {
        let ks = self.ensure_open()?;
        Ok(ks.records.get(key).map(|record| record.clone()))
    }

    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let ks = self.ensure_open()?;
        let mut keys: Vec<String> = ks
            .scalars
            .iter()
            .map(|e| e.key().clone())
            .chain(ks.records.iter().map(|e| e.key().clone()))
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        let ks = self.ensure_open()?;
        ks.published.fetch_add(1, Ordering::Relaxed);
        if let Some(mut subscribers) = ks.channels.get_mut(channel) {
            subscribers.retain(|s| s.tx.send(payload.to_string()).is_ok());
        }
        ks.channels.remove_if(channel, |_, subs| subs.is_empty());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription> {
        let ks = self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ks.subscribers.fetch_add(1, Ordering::Relaxed);
        ks.channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                id,
                connection: self.connection,
                tx,
            });
        let keyspace: Weak<Keyspace> = Arc::downgrade(&self.keyspace);
        let name = channel.to_string();
        Ok(Subscription::new(channel, rx).on_drop(move || {
            if let Some(keyspace) = keyspace.upgrade() {
                keyspace.unsubscribe(&name, id);
            }
        }))
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
        let ks = self.ensure_open()?;
        let now = Instant::now();
        let mut locks = ks.locks.lock();
        if let Some(entry) = locks.get(key) {
            if entry.expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            LockEntry {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, owner: &str) -> anyhow::Result<()> {
        let ks = self.ensure_open()?;
        let mut locks = ks.locks.lock();
        if locks.get(key).is_some_and(|entry| entry.owner == owner) {
            locks.remove(key);
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::Release);
        // Dropping this connection's senders ends its subscriptions.
        self.keyspace.channels.retain(|_, subscribers| {
            subscribers.retain(|s| s.connection != self.connection);
            !subscribers.is_empty()
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
