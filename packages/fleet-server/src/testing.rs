//! Test doubles shared by the module tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::ManualClock;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::cluster::{ClusterConfig, ClusterContext};
use crate::storage::MemoryStore;
use crate::traits::{SessionTransport, WorkerProbe};

/// Start time of every test clock.
pub(crate) const T0: u64 = 1_700_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportEvent {
    Message { session: Uuid, text: String },
    Disconnect { session: Uuid, reason: String },
    Connect { session: Uuid, worker_address: String },
    Token { session: Uuid, token: Vec<u8> },
    Redirect { session: Uuid, node_address: String },
}

/// Transport that records every call.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    events: Mutex<Vec<TransportEvent>>,
}

impl RecordingTransport {
    pub(crate) fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn disconnects(&self) -> Vec<Uuid> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Disconnect { session, .. } => Some(session),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: TransportEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl SessionTransport for RecordingTransport {
    async fn send_message(&self, session_id: Uuid, message: &str) -> anyhow::Result<()> {
        self.record(TransportEvent::Message {
            session: session_id,
            text: message.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self, session_id: Uuid, reason: &str) -> anyhow::Result<()> {
        self.record(TransportEvent::Disconnect {
            session: session_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn connect_to_worker(
        &self,
        session_id: Uuid,
        worker_address: &str,
    ) -> anyhow::Result<()> {
        self.record(TransportEvent::Connect {
            session: session_id,
            worker_address: worker_address.to_string(),
        });
        Ok(())
    }

    async fn store_redirect_token(&self, session_id: Uuid, token: &[u8]) -> anyhow::Result<()> {
        self.record(TransportEvent::Token {
            session: session_id,
            token: token.to_vec(),
        });
        Ok(())
    }

    async fn redirect(&self, session_id: Uuid, node_address: &str) -> anyhow::Result<()> {
        self.record(TransportEvent::Redirect {
            session: session_id,
            node_address: node_address.to_string(),
        });
        Ok(())
    }
}

/// Probe that reports every address reachable unless marked down.
#[derive(Default)]
pub(crate) struct ScriptedProbe {
    down: Mutex<HashSet<String>>,
}

impl ScriptedProbe {
    pub(crate) fn mark_down(&self, address: &str) {
        self.down.lock().insert(address.to_string());
    }
}

#[async_trait]
impl WorkerProbe for ScriptedProbe {
    async fn is_reachable(&self, address: &str) -> bool {
        !self.down.lock().contains(address)
    }
}

/// One simulated node and its doubles.
pub(crate) struct TestNode {
    pub ctx: Arc<ClusterContext>,
    pub transport: Arc<RecordingTransport>,
    pub probe: Arc<ScriptedProbe>,
    pub clock: Arc<ManualClock>,
}

pub(crate) fn test_node(store: &Arc<MemoryStore>) -> TestNode {
    test_node_with(store, ClusterConfig::default())
}

pub(crate) fn test_node_with(store: &Arc<MemoryStore>, config: ClusterConfig) -> TestNode {
    let transport = Arc::new(RecordingTransport::default());
    let probe = Arc::new(ScriptedProbe::default());
    let clock = Arc::new(ManualClock::new(T0));
    let ctx = Arc::new(ClusterContext::new(
        Uuid::new_v4(),
        config,
        store.clone(),
        transport.clone(),
        probe.clone(),
        clock.clone(),
    ));
    TestNode {
        ctx,
        transport,
        probe,
        clock,
    }
}
