//! End-to-end federation scenarios over the in-memory broker.
//!
//! Each test boots a five-node federation (counter starting at zero) and
//! drives it through one of the failure shapes the protocol must survive:
//! clean commits, unreachable peers, concurrent proposers, restarts, and
//! minority partitions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use countermesh_bus::{InMemoryBroker, Message, Payload, QueueTransport};
use countermesh_consensus::{FederationNode, NodeOptions};
use countermesh_core::{ConsensusState, FederationConfig, NodeId};

const MEMBERS: [&str; 5] = ["n1", "n2", "n3", "n4", "n5"];

fn test_config(node: &str) -> FederationConfig {
    let mut config = FederationConfig::default();
    config.node_id = NodeId::new(node);
    config.known_nodes = MEMBERS.iter().map(|m| NodeId::from(*m)).collect();
    config.proposal_timeout = Duration::from_millis(700);
    config.recovery_timeout = Duration::from_millis(400);
    config.recovery_retry_interval = Duration::from_millis(100);
    config.max_recovery_attempts = 3;
    config.send_max_retries = 3;
    config.send_base_backoff = Duration::from_millis(1);
    config.send_deadline = Duration::from_secs(2);
    config.poll_wait = Duration::from_millis(20);
    config.shutdown_grace = Duration::from_secs(1);
    config
}

fn queue_of(node: &str) -> String {
    format!("consensus-{node}-queue")
}

struct Federation {
    broker: Arc<InMemoryBroker>,
    nodes: Vec<Arc<FederationNode>>,
}

impl Federation {
    /// Boot all five members fresh (no recovery; everyone starts at zero).
    async fn boot() -> Result<Self> {
        let broker = Arc::new(InMemoryBroker::new());
        let mut nodes = Vec::new();
        for member in MEMBERS {
            let node = FederationNode::start(
                test_config(member),
                broker.clone(),
                NodeOptions {
                    recover_on_start: false,
                },
            )
            .await?;
            nodes.push(node);
        }
        Ok(Self { broker, nodes })
    }

    fn node(&self, name: &str) -> &Arc<FederationNode> {
        self.nodes
            .iter()
            .find(|node| node.node_id().as_str() == name)
            .expect("unknown node")
    }

    /// Replace one member with a fresh instance that runs recovery, as a
    /// restarted process would.
    async fn restart(&mut self, name: &str) -> Result<()> {
        let index = self
            .nodes
            .iter()
            .position(|node| node.node_id().as_str() == name)
            .expect("unknown node");
        self.nodes[index].shutdown().await;
        let node = FederationNode::start(
            test_config(name),
            self.broker.clone(),
            NodeOptions {
                recover_on_start: true,
            },
        )
        .await?;
        self.nodes[index] = node;
        Ok(())
    }

    /// Retry an increment against `name` until it is accepted.
    async fn increment_via(&self, name: &str) {
        let node = self.node(name);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let response = node.request_increment().await;
            if response.success {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{name} kept answering busy: {}",
                response.message
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_counter(&self, name: &str, expected: u64) {
        let node = self.node(name);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while node.counter() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{name} never reached {expected} (at {})",
                node.counter()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every node outside `except` settles at `expected` and
    /// IDLE.
    async fn wait_all(&self, expected: u64, except: &[&str]) {
        for member in MEMBERS {
            if except.contains(&member) {
                continue;
            }
            self.wait_counter(member, expected).await;
        }
        self.wait_idle(except).await;
    }

    async fn wait_idle(&self, except: &[&str]) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let all_idle = self
                .nodes
                .iter()
                .filter(|node| !except.contains(&node.node_id().as_str()))
                .all(|node| node.snapshot().consensus_state == ConsensusState::Idle);
            if all_idle {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "federation never settled to IDLE"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_increment_reaches_every_node() -> Result<()> {
    let federation = Federation::boot().await?;

    federation.increment_via("n1").await;
    federation.wait_all(1, &[]).await;

    for node in &federation.nodes {
        let snap = node.snapshot();
        assert_eq!(snap.counter, 1);
        assert_eq!(snap.consensus_state, ConsensusState::Idle);
        assert!(snap.current_proposal.is_none());
        assert!(snap.received_votes.is_empty());
    }

    federation.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_peer_misses_the_commit_and_recovers() -> Result<()> {
    let mut federation = Federation::boot().await?;
    federation.broker.block(&queue_of("n5"));

    federation.increment_via("n1").await;
    federation.wait_all(1, &["n5"]).await;

    // n5 saw nothing; its counter is still zero.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(federation.node("n5").counter(), 0);

    // Transport restored; a restarted n5 adopts the counter via recovery.
    federation.broker.unblock(&queue_of("n5"));
    federation.restart("n5").await?;
    federation.wait_counter("n5", 1).await;
    assert_eq!(
        federation.node("n5").snapshot().consensus_state,
        ConsensusState::Idle
    );

    federation.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_proposals_commit_at_most_one_increment() -> Result<()> {
    let federation = Federation::boot().await?;

    let first = federation.node("n1").clone();
    let third = federation.node("n3").clone();
    let (a, b) = tokio::join!(first.request_increment(), third.request_increment());
    // At least one side gets to propose; the other may already be voting
    // on the first's proposal and answer busy.
    assert!(a.success || b.success, "{} / {}", a.message, b.message);

    // Let the race resolve: commit, abort broadcast, or proposal deadline.
    federation.wait_idle(&[]).await;
    let counters: Vec<u64> = federation.nodes.iter().map(|node| node.counter()).collect();
    let agreed = counters[0];
    assert!(agreed <= 1, "more than one increment committed: {counters:?}");
    assert!(
        counters.iter().all(|c| *c == agreed),
        "federation diverged: {counters:?}"
    );

    federation.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_node_adopts_the_federation_counter() -> Result<()> {
    let mut federation = Federation::boot().await?;

    for value in 1..=7 {
        federation.increment_via("n1").await;
        federation.wait_all(value, &[]).await;
    }

    federation.restart("n2").await?;
    federation.wait_counter("n2", 7).await;
    let snap = federation.node("n2").snapshot();
    assert_eq!(snap.consensus_state, ConsensusState::Idle);
    assert!(!snap.recovering);

    federation.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_partition_cannot_commit() -> Result<()> {
    let federation = Federation::boot().await?;

    // Cut n1..n3 off: nothing the minority sends reaches the majority.
    for member in ["n1", "n2", "n3"] {
        federation.broker.block(&queue_of(member));
    }

    let response = federation.node("n4").request_increment().await;
    assert!(response.success, "proposal should start in the minority");

    // Quorum is unreachable: the proposal must die by deadline with no
    // commit anywhere.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    for node in &federation.nodes {
        assert_eq!(node.counter(), 0, "split-brain commit at {}", node.node_id());
    }

    // Partition heals; nothing changes without a new proposal.
    for member in ["n1", "n2", "n3"] {
        federation.broker.unblock(&queue_of(member));
    }
    federation.wait_idle(&[]).await;
    for node in &federation.nodes {
        assert_eq!(node.counter(), 0);
    }

    federation.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovery_tie_break_adopts_the_maximum() -> Result<()> {
    // Only n3 runs; the test plays the peers by hand to control the
    // recovery responses exactly.
    let broker = Arc::new(InMemoryBroker::new());
    let node = FederationNode::start(
        test_config("n3"),
        broker.clone(),
        NodeOptions {
            recover_on_start: true,
        },
    )
    .await?;

    // Simulated peers answer every request round with {5, 5, 7}: no
    // majority at the floor of three, so n3 must adopt the maximum.
    // n1 stays silent.
    let mut responders = Vec::new();
    for (responder, counter) in [("n2", 5u64), ("n4", 5), ("n5", 7)] {
        let broker = broker.clone();
        responders.push(tokio::spawn(async move {
            loop {
                let Ok(deliveries) = broker
                    .dequeue(&queue_of(responder), 10, Duration::from_millis(50))
                    .await
                else {
                    return;
                };
                for delivery in deliveries {
                    let Ok(message) = serde_json::from_slice::<Message>(&delivery.body) else {
                        continue;
                    };
                    if let Payload::RecoveryRequest { request_id } = message.payload {
                        let response = Message::direct(
                            NodeId::new(responder),
                            NodeId::new("n3"),
                            Payload::RecoveryResponse {
                                request_id,
                                counter: Some(counter),
                                state: ConsensusState::Idle,
                            },
                        );
                        let body = serde_json::to_vec(&response).unwrap();
                        let _ = broker.enqueue(&queue_of("n3"), body).await;
                    }
                    let _ = broker.ack(&delivery.token).await;
                }
            }
        }));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while node.counter() != 7 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "n3 never adopted the tie-break value (at {})",
            node.counter()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(node.snapshot().consensus_state, ConsensusState::Idle);

    for responder in responders {
        responder.abort();
    }
    node.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovery_without_quorum_fails_and_refuses_proposals() -> Result<()> {
    // n2 boots alone: no peer will ever answer.
    let broker = Arc::new(InMemoryBroker::new());
    let mut config = test_config("n2");
    config.max_recovery_attempts = 2;
    let node = FederationNode::start(
        config,
        broker,
        NodeOptions {
            recover_on_start: true,
        },
    )
    .await?;

    // Wait out both rounds plus the retry interval.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snap = node.snapshot();
        if snap.recovery_failed {
            assert_eq!(snap.counter, 0);
            assert_eq!(snap.consensus_state, ConsensusState::Idle);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "recovery never surfaced failure"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let response = node.request_increment().await;
    assert!(!response.success);
    assert!(response.message.contains("recovery failed"));

    node.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counters_rise_monotonically_under_concurrent_load() -> Result<()> {
    let federation = Federation::boot().await?;

    let mut last_seen = vec![0u64; federation.nodes.len()];
    for round in 0..6 {
        // Two concurrent triggers per round on different nodes.
        let a = federation.node(MEMBERS[round % 5]).clone();
        let b = federation.node(MEMBERS[(round + 2) % 5]).clone();
        let _ = tokio::join!(a.request_increment(), b.request_increment());

        // Sample while the round settles: counters may differ across nodes
        // but must never move backwards on any node.
        for _ in 0..10 {
            for (index, node) in federation.nodes.iter().enumerate() {
                let current = node.counter();
                assert!(
                    current >= last_seen[index],
                    "{} went backwards: {} -> {current}",
                    node.node_id(),
                    last_seen[index]
                );
                last_seen[index] = current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        federation.wait_idle(&[]).await;
    }

    // Everyone agrees in the end.
    federation.wait_idle(&[]).await;
    let counters: Vec<u64> = federation.nodes.iter().map(|node| node.counter()).collect();
    assert!(
        counters.windows(2).all(|pair| pair[0] == pair[1]),
        "federation diverged: {counters:?}"
    );

    federation.shutdown().await;
    Ok(())
}
