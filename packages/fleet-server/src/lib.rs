//! Fleet Server: replicated cluster state, task dispatch, crash detection
//! and session transfer for a fleet of peer proxy nodes.

pub mod cluster;
pub mod config;
pub mod storage;
pub mod task;
pub mod traits;
pub mod worker;

#[cfg(test)]
mod testing;

pub use cluster::{ClusterConfig, ClusterContext, ClusterError, FleetNode};
pub use traits::{ClusterStore, SessionTransport, Subscription, WorkerProbe};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
