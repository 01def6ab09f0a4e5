//! In-process federation load simulation.
//!
//! Phased orchestration: boot the federation, drive randomized increment
//! load from concurrent trigger workers, wait for convergence, then verify
//! that every reachable node reports the same counter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use countermesh_bus::InMemoryBroker;
use countermesh_consensus::{FederationNode, MetricsSnapshot, NodeOptions};
use countermesh_core::{ConsensusState, FederationConfig, NodeId};

use crate::args::SimulateArgs;

/// Outcome of one simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub requested: u64,
    pub accepted: u64,
    pub busy_retries: u64,
    pub gave_up: u64,
    pub final_counter: u64,
    pub converged: bool,
    pub duration_secs: f64,
    pub per_node_counters: BTreeMap<String, u64>,
    pub per_node_metrics: BTreeMap<String, MetricsSnapshot>,
}

#[derive(Debug, Default)]
struct LoadCounters {
    accepted: u64,
    busy_retries: u64,
    gave_up: u64,
}

fn simulation_config(node: &NodeId, members: &[NodeId]) -> FederationConfig {
    let mut config = FederationConfig::default();
    config.node_id = node.clone();
    config.known_nodes = members.to_vec();
    config.proposal_timeout = Duration::from_secs(2);
    config.recovery_timeout = Duration::from_millis(500);
    config.recovery_retry_interval = Duration::from_millis(250);
    config.send_base_backoff = Duration::from_millis(5);
    config.send_deadline = Duration::from_secs(2);
    config.poll_wait = Duration::from_millis(50);
    config.shutdown_grace = Duration::from_secs(2);
    config
}

pub async fn run(args: SimulateArgs) -> Result<SimulationReport> {
    if args.nodes < 3 {
        bail!("a federation needs at least 3 nodes");
    }
    let members: Vec<NodeId> = (1..=args.nodes)
        .map(|i| NodeId::new(format!("n{i}")))
        .collect();
    if let Some(blocked) = &args.block_node {
        if !members.iter().any(|m| m.as_str() == blocked) {
            bail!("--block-node {blocked} is not a federation member");
        }
    }

    let started = Instant::now();

    info!("📡 Phase 1: federation boot ({} nodes)", args.nodes);
    let broker = Arc::new(InMemoryBroker::new());
    let mut nodes = Vec::new();
    for member in &members {
        let config = simulation_config(member, &members);
        let node = FederationNode::start(
            config,
            broker.clone(),
            NodeOptions {
                recover_on_start: false,
            },
        )
        .await?;
        nodes.push(node);
    }

    let blocked_queue = args.block_node.as_ref().map(|node| {
        let queue = format!("consensus-{node}-queue");
        warn!(node, "blocking inbound queue for the whole run");
        broker.block(&queue);
        queue
    });

    info!(
        "⚡ Phase 2: increment load ({} requests, {} workers)",
        args.increments, args.concurrency
    );
    let counters = Arc::new(Mutex::new(LoadCounters::default()));
    let remaining = Arc::new(Mutex::new(args.increments));
    let mut workers = Vec::new();
    for _ in 0..args.concurrency.max(1) {
        let nodes = nodes.clone();
        let counters = counters.clone();
        let remaining = remaining.clone();
        let retries = args.retries;
        let blocked = args.block_node.clone();
        workers.push(tokio::spawn(async move {
            loop {
                {
                    let mut left = remaining.lock().await;
                    if *left == 0 {
                        return;
                    }
                    *left -= 1;
                }
                let mut attempts = 0u32;
                loop {
                    // Triggers never target the blocked node; its queue
                    // would swallow the request until redelivery.
                    let target = {
                        let mut rng = rand::thread_rng();
                        loop {
                            let candidate = &nodes[rng.gen_range(0..nodes.len())];
                            if Some(candidate.node_id().as_str())
                                != blocked.as_deref()
                            {
                                break candidate.clone();
                            }
                        }
                    };
                    let response = target.request_increment().await;
                    if response.success {
                        counters.lock().await.accepted += 1;
                        break;
                    }
                    attempts += 1;
                    if attempts > retries {
                        counters.lock().await.gave_up += 1;
                        break;
                    }
                    counters.lock().await.busy_retries += 1;
                    tokio::time::sleep(Duration::from_millis(10 * attempts as u64)).await;
                }
            }
        }));
    }
    for worker in workers {
        worker.await?;
    }

    info!("⏳ Phase 3: waiting for convergence");
    let reachable: Vec<_> = nodes
        .iter()
        .filter(|node| Some(node.node_id().as_str()) != args.block_node.as_deref())
        .collect();
    let settle_deadline = Instant::now() + Duration::from_secs(args.settle_secs);
    let converged = loop {
        let counters: Vec<u64> = reachable.iter().map(|node| node.counter()).collect();
        let all_idle = reachable
            .iter()
            .all(|node| node.snapshot().consensus_state == ConsensusState::Idle);
        let all_equal = counters.windows(2).all(|pair| pair[0] == pair[1]);
        if all_idle && all_equal {
            break true;
        }
        if Instant::now() >= settle_deadline {
            break false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    if let Some(queue) = &blocked_queue {
        broker.unblock(queue);
    }

    info!("✅ Phase 4: verification and shutdown");
    let load = counters.lock().await;
    let per_node_counters: BTreeMap<String, u64> = nodes
        .iter()
        .map(|node| (node.node_id().to_string(), node.counter()))
        .collect();
    let per_node_metrics: BTreeMap<String, MetricsSnapshot> = nodes
        .iter()
        .map(|node| (node.node_id().to_string(), node.metrics()))
        .collect();
    let final_counter = per_node_counters.values().copied().max().unwrap_or(0);

    for node in &nodes {
        node.shutdown().await;
    }

    let report = SimulationReport {
        requested: args.increments,
        accepted: load.accepted,
        busy_retries: load.busy_retries,
        gave_up: load.gave_up,
        final_counter,
        converged,
        duration_secs: started.elapsed().as_secs_f64(),
        per_node_counters,
        per_node_metrics,
    };

    if !report.converged {
        warn!("federation did not converge within {}s", args.settle_secs);
    }
    Ok(report)
}
