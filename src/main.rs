// countermesh - replicated-counter federation host
//
// Boots a full federation over the in-process queue broker: one
// FederationNode per configured member, all sharing one InMemoryBroker.
// The QueueTransport trait is the seam where a hosted queue service plugs
// in; this binary is the reference host used for demos and load testing.
//
// Lifecycle: load and validate configuration, initialize logging, start
// every node, then run until a shutdown signal arrives and drain the task
// groups with a bounded grace period. Exit code 0 on clean shutdown,
// non-zero on unrecoverable init failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use countermesh_bus::InMemoryBroker;
use countermesh_consensus::{FederationNode, NodeOptions};
use countermesh_core::FederationConfig;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "countermesh.json".to_string());

    let config = match FederationConfig::load(&config_path).await {
        Ok(config) => config,
        Err(err) => {
            eprintln!("countermesh: invalid configuration: {err:#}");
            std::process::exit(2);
        }
    };

    // Environment filter wins over the configured level (RUST_LOG=debug).
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("countermesh={}", config.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();

    info!("🚀 Starting countermesh federation host");
    info!(
        federation = config.federation_size(),
        prefix = %config.queue_name_prefix,
        "configuration loaded from {config_path}"
    );

    let broker = Arc::new(InMemoryBroker::new());
    let mut nodes = Vec::new();
    for member in &config.known_nodes {
        let node_config = config.for_node(member.clone());
        // Fresh federation boot: every node starts from zero together, so
        // recovery (which needs live, settled peers) is skipped.
        match FederationNode::start(
            node_config,
            broker.clone(),
            NodeOptions {
                recover_on_start: false,
            },
        )
        .await
        {
            Ok(node) => nodes.push(node),
            Err(err) => {
                error!(node = %member, "failed to start node: {err:#}");
                std::process::exit(1);
            }
        }
    }
    info!(nodes = nodes.len(), "federation running; send SIGINT to stop");

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = status.tick() => {
                for node in &nodes {
                    let snapshot = node.snapshot();
                    info!(
                        node = %snapshot.node_id,
                        counter = snapshot.counter,
                        state = %snapshot.consensus_state,
                        "status"
                    );
                }
            }
        }
    }

    info!("shutdown signal received, draining nodes");
    for node in &nodes {
        node.shutdown().await;
    }
    info!("✅ countermesh stopped cleanly");
    Ok(())
}
