//! Runs one node against an in-process store until Ctrl-C, logging every
//! session transport call instead of acting on real connections.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use fleet_core::SystemClock;
use fleet_server::cluster::{ClusterContext, FleetNode};
use fleet_server::config::NodeArgs;
use fleet_server::storage::MemoryStore;
use fleet_server::traits::{SessionTransport, TcpWorkerProbe};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Transport that only logs.
struct LoggingTransport;

#[async_trait]
impl SessionTransport for LoggingTransport {
    async fn send_message(&self, session_id: Uuid, message: &str) -> anyhow::Result<()> {
        info!(session_id = %session_id, message, "send message");
        Ok(())
    }

    async fn disconnect(&self, session_id: Uuid, reason: &str) -> anyhow::Result<()> {
        info!(session_id = %session_id, reason, "disconnect");
        Ok(())
    }

    async fn connect_to_worker(&self, session_id: Uuid, worker_address: &str) -> anyhow::Result<()> {
        info!(session_id = %session_id, worker_address, "connect to worker");
        Ok(())
    }

    async fn store_redirect_token(&self, session_id: Uuid, token: &[u8]) -> anyhow::Result<()> {
        info!(session_id = %session_id, token = %String::from_utf8_lossy(token), "store redirect token");
        Ok(())
    }

    async fn redirect(&self, session_id: Uuid, node_address: &str) -> anyhow::Result<()> {
        info!(session_id = %session_id, node_address, "redirect");
        Ok(())
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = NodeArgs::parse();
    init_tracing(args.json_logs);

    let config = args.cluster_config().context("invalid timing configuration")?;
    let probe = TcpWorkerProbe::new(config.probe_timeout());
    let ctx = Arc::new(ClusterContext::new(
        args.node_id(),
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(LoggingTransport),
        Arc::new(probe),
        Arc::new(SystemClock),
    ));

    let node = FleetNode::start(Arc::clone(&ctx), &args.address)
        .await
        .context("node failed to start")?;
    for address in &args.workers {
        let worker = ctx
            .entities
            .register_worker(Uuid::new_v4(), address)
            .await
            .with_context(|| format!("registering worker {address}"))?;
        info!(worker_id = %worker.id, address, "worker registered");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let report = node.shutdown().await?;
    info!(
        transferred = report.transferred.len(),
        disconnected = report.disconnected.len(),
        "bye"
    );
    Ok(())
}
