//! Node wiring: task groups, startup ordering, and shutdown.
//!
//! A federation node is one process hosting a handful of cooperating tasks:
//! a serial inbound dispatcher that polls the bus and feeds the coordinator,
//! a heartbeat tick, the per-proposal deadline timers the coordinator arms,
//! and (after a restart) the one-shot recovery task. All of them hang off a
//! single cancellation token; shutdown cancels the token and waits for the
//! group with a bounded grace period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use countermesh_bus::{MessageBus, QueueTransport, TriggerResponse};
use countermesh_core::{FederationConfig, NodeId};

use crate::coordinator::ConsensusCoordinator;
use crate::metrics::{ConsensusMetrics, MetricsSnapshot};
use crate::recovery::RecoveryCoordinator;
use crate::store::{NodeState, StateStore};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Startup knobs that are not federation configuration.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Run the recovery protocol before taking proposer or voter duties.
    /// True for every restart; a brand-new federation booting all nodes at
    /// once passes false, since every peer would decline while itself
    /// recovering and no round could ever gather three responses.
    pub recover_on_start: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            recover_on_start: true,
        }
    }
}

/// One running federation node.
pub struct FederationNode {
    config: FederationConfig,
    store: Arc<StateStore>,
    coordinator: Arc<ConsensusCoordinator>,
    metrics: Arc<ConsensusMetrics>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl FederationNode {
    /// Validate configuration, wire the components, and spawn the task
    /// group. The returned handle stays valid until [`shutdown`].
    ///
    /// [`shutdown`]: Self::shutdown
    pub async fn start(
        config: FederationConfig,
        transport: Arc<dyn QueueTransport>,
        options: NodeOptions,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(StateStore::new(
            config.node_id.clone(),
            config.known_nodes.clone(),
        ));
        let bus = Arc::new(MessageBus::new(&config, transport));
        let metrics = Arc::new(ConsensusMetrics::default());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (recovery_tx, recovery_rx) = mpsc::channel(64);

        let coordinator = Arc::new(ConsensusCoordinator::new(
            config.clone(),
            store.clone(),
            bus.clone(),
            metrics.clone(),
            recovery_tx,
            cancel.clone(),
            tracker.clone(),
        ));

        // Inbound dispatcher: the only consumer of this node's queue.
        // Messages are processed strictly in receive order and acked only
        // after their handler finishes.
        {
            let coordinator = coordinator.clone();
            let bus = bus.clone();
            let cancel = cancel.clone();
            let max_batch = config.poll_max_batch;
            let wait = config.poll_wait;
            let node = config.node_id.clone();
            tracker.spawn(Box::pin(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        polled = Box::pin(bus.poll(max_batch, wait)) => match polled {
                            Ok(batch) => {
                                for inbound in batch {
                                    Box::pin(coordinator.on_message(inbound.message)).await;
                                    if let Err(err) = Box::pin(bus.ack(&inbound.token)).await {
                                        warn!(node = %node, "ack failed: {err}");
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(node = %node, "poll failed: {err}");
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                                }
                            }
                        }
                    }
                }
                debug!(node = %node, "dispatcher stopped");
            }));
        }

        // Heartbeat tick.
        {
            let store = store.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                            store.write(|s| s.touch_heartbeat());
                        }
                    }
                }
            });
        }

        if options.recover_on_start {
            let recovery = RecoveryCoordinator::new(
                config.clone(),
                store.clone(),
                bus.clone(),
                metrics.clone(),
                recovery_rx,
            );
            let cancel = cancel.clone();
            tracker.spawn(async move {
                recovery.run(cancel).await;
            });
        }

        info!(node = %config.node_id, federation = config.federation_size(), "node started");

        Ok(Arc::new(Self {
            config,
            store,
            coordinator,
            metrics,
            cancel,
            tracker,
        }))
    }

    /// External increment trigger entry point.
    pub async fn request_increment(&self) -> TriggerResponse {
        self.coordinator.on_increment_request().await
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn counter(&self) -> u64 {
        self.store.counter()
    }

    pub fn snapshot(&self) -> NodeState {
        self.store.snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cancel the task group and wait up to the configured grace period for
    /// it to drain.
    pub async fn shutdown(&self) {
        info!(node = %self.config.node_id, "shutting down");
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                node = %self.config.node_id,
                "shutdown grace period elapsed with tasks still running"
            );
        }
    }
}
