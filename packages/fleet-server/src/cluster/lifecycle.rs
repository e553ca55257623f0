//! Node phases and in-flight task accounting.
//!
//! The phase lives in a `watch` channel so listener loops can wait for the
//! node to reach `Closing` without polling. Running task handlers hold an
//! [`InFlightGuard`]; the last guard to drop wakes anyone waiting for the
//! node to go idle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

/// Phase of a node, in the order it passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthState {
    /// Registering with the cluster; listeners not yet subscribed.
    Starting,
    /// Heartbeating and serving tasks.
    Ready,
    /// Heartbeat stopped; sessions are being moved off this node. Listeners
    /// still answer so transfer handshakes can complete.
    Draining,
    /// Listener loops are exiting and dropping their subscriptions.
    Closing,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn serves_listeners(self) -> bool {
        self < HealthState::Closing
    }
}

#[derive(Debug, Default)]
struct InFlight {
    running: AtomicUsize,
    idle: Notify,
}

/// Shared phase and task counter of one node.
#[derive(Debug)]
pub struct NodeLifecycle {
    phase: watch::Sender<HealthState>,
    in_flight: Arc<InFlight>,
}

impl NodeLifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (phase, _) = watch::channel(HealthState::Starting);
        Self {
            phase,
            in_flight: Arc::default(),
        }
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        *self.phase.borrow()
    }

    /// Moves the node forward to `next`. Returns `false`, leaving the phase
    /// alone, when the node is already at or past it.
    pub fn advance(&self, next: HealthState) -> bool {
        self.phase.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once the node has reached `Closing`.
    pub async fn closing(&self) {
        let mut phase = self.phase.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = phase.wait_for(|p| !p.serves_listeners()).await;
    }

    /// Counts one running task handler until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.running.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(Arc::clone(&self.in_flight))
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.running.load(Ordering::Acquire)
    }

    /// Waits until no task handler is running. Returns `false` when some
    /// were still running after `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let woken = self.in_flight.idle.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                woken.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }
}

impl Default for NodeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one task handler as running.
#[derive(Debug)]
pub struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
