//! Consensus coordinator: drives a proposal through PROPOSE → VOTE → COMMIT
//! and arbitrates between concurrent proposals.
//!
//! Every handler follows the same shape: take the state store's write lock
//! once, validate preconditions, mutate, and return a description of the
//! network I/O to perform; then release the lock and perform it. Handlers
//! that touch the lock again afterwards re-validate that the proposal is
//! still the one they acted for.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use countermesh_bus::{Message, MessageBus, Payload, TriggerResponse};
use countermesh_core::{ConsensusState, FederationConfig, NodeId};

use crate::metrics::ConsensusMetrics;
use crate::recovery::RecoveryEvent;
use crate::store::{RecordedVote, StateStore};
use crate::tally::{TallyDecision, VoteTally};

enum IncrementAction {
    Propose { proposal_id: Uuid, value: u64 },
    Busy(String),
}

enum ProposeAction {
    Reply {
        accept: bool,
        reason: Option<String>,
        arm: Option<Uuid>,
    },
    Drop(&'static str),
}

enum VoteAction {
    Commit { proposal_id: Uuid, value: u64 },
    Abort { proposal_id: Uuid },
    Wait,
    Drop(&'static str),
}

enum CommitAction {
    Applied(u64),
    /// Commit for the live proposal whose value is already current; the
    /// proposal is settled without touching the counter.
    Settled,
    /// Commit from a round this node never saw; adopted because the value
    /// is ahead of the local counter.
    Late(u64),
    Drop(&'static str),
}

/// Per-node protocol driver. One instance per [`FederationNode`].
///
/// [`FederationNode`]: crate::node::FederationNode
pub struct ConsensusCoordinator {
    config: FederationConfig,
    store: Arc<StateStore>,
    bus: Arc<MessageBus>,
    metrics: Arc<ConsensusMetrics>,
    recovery_tx: mpsc::Sender<RecoveryEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ConsensusCoordinator {
    pub fn new(
        config: FederationConfig,
        store: Arc<StateStore>,
        bus: Arc<MessageBus>,
        metrics: Arc<ConsensusMetrics>,
        recovery_tx: mpsc::Sender<RecoveryEvent>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            metrics,
            recovery_tx,
            cancel,
            tracker,
        }
    }

    fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    fn is_member(&self, node: &NodeId) -> bool {
        self.config.known_nodes.contains(node)
    }

    fn trigger_response(&self, success: bool, message: String) -> TriggerResponse {
        let snapshot = self.store.snapshot();
        TriggerResponse {
            success,
            current_value: Some(snapshot.counter),
            node_id: snapshot.node_id,
            message,
            state: snapshot.consensus_state,
        }
    }

    /// Entry point for the external increment trigger. Returns `busy` when
    /// the node is not IDLE; the trigger retries or picks another node.
    pub async fn on_increment_request(&self) -> TriggerResponse {
        let action = self.store.write(|s| {
            if s.recovery_failed {
                return IncrementAction::Busy(
                    "recovery failed; node is not accepting proposer duties".to_string(),
                );
            }
            if s.consensus_state != ConsensusState::Idle {
                return IncrementAction::Busy(format!("busy: {}", s.consensus_state));
            }
            let proposal_id = Uuid::new_v4();
            let value = s.counter + 1;
            if let Err(err) = s.transition_to(ConsensusState::Proposing) {
                return IncrementAction::Busy(err.to_string());
            }
            if let Err(err) = s.begin_proposal(proposal_id, value) {
                return IncrementAction::Busy(err.to_string());
            }
            IncrementAction::Propose { proposal_id, value }
        });

        match action {
            IncrementAction::Busy(message) => {
                debug!(node = %self.node_id(), "increment refused: {message}");
                self.trigger_response(false, message)
            }
            IncrementAction::Propose { proposal_id, value } => {
                self.metrics.proposal_started();
                info!(
                    node = %self.node_id(),
                    proposal = %proposal_id,
                    value,
                    "proposal started"
                );
                // The proposer's own accept is implicit; only peers vote.
                let propose = Message::broadcast(
                    self.node_id().clone(),
                    Payload::Propose {
                        proposal_id,
                        proposed_value: value,
                    },
                );
                let delivered = self.bus.broadcast(&propose).await;
                debug!(
                    node = %self.node_id(),
                    proposal = %proposal_id,
                    delivered,
                    "proposal broadcast"
                );
                self.arm_proposal_deadline(proposal_id);
                self.trigger_response(true, format!("proposal {proposal_id} started"))
            }
        }
    }

    /// Dispatch one inbound message by kind.
    pub async fn on_message(&self, message: Message) {
        let source = message.source_node_id.clone();
        match message.payload {
            Payload::IncrementRequest => {
                let response = self.on_increment_request().await;
                info!(
                    node = %self.node_id(),
                    trigger = %source,
                    success = response.success,
                    "queue-delivered increment request: {}",
                    response.message
                );
            }
            Payload::Propose {
                proposal_id,
                proposed_value,
            } => self.handle_propose(source, proposal_id, proposed_value).await,
            Payload::Vote {
                proposal_id,
                accept,
                reason,
            } => self.handle_vote(source, proposal_id, accept, reason).await,
            Payload::Commit {
                proposal_id,
                proposed_value,
            } => self.handle_commit(source, proposal_id, proposed_value).await,
            Payload::Abort {
                proposal_id,
                reason,
            } => self.handle_abort(source, proposal_id, reason).await,
            Payload::RecoveryRequest { request_id } => {
                self.handle_recovery_request(source, request_id).await
            }
            Payload::RecoveryResponse {
                request_id,
                counter,
                state: _,
            } => {
                let event = RecoveryEvent {
                    responder: source,
                    request_id,
                    counter,
                };
                if self.recovery_tx.try_send(event).is_err() {
                    debug!(
                        node = %self.node_id(),
                        "recovery response dropped: no recovery round in progress"
                    );
                    self.metrics.message_dropped();
                }
            }
        }
    }

    async fn handle_propose(&self, source: NodeId, proposal_id: Uuid, proposed_value: u64) {
        if !self.is_member(&source) {
            debug!(source = %source, "proposal from unknown node dropped");
            self.metrics.message_dropped();
            return;
        }

        let action = self.store.write(|s| {
            if s.recovering {
                // Our counter is untrusted mid-recovery; reject without
                // touching consensus state.
                return ProposeAction::Reply {
                    accept: false,
                    reason: Some("recovering".to_string()),
                    arm: None,
                };
            }
            if s.consensus_state.carries_proposal() {
                return match s.current_proposal_id() {
                    Some(current) if current == proposal_id => {
                        // Duplicate PROPOSE from an at-least-once transport:
                        // answer again so a lost VOTE is healed.
                        let accept = proposed_value == s.counter + 1;
                        ProposeAction::Reply {
                            accept,
                            reason: (!accept).then(|| format!("expected {}", s.counter + 1)),
                            arm: None,
                        }
                    }
                    _ => ProposeAction::Reply {
                        accept: false,
                        reason: Some("busy".to_string()),
                        arm: None,
                    },
                };
            }
            // IDLE, or the tail of recovery where RECOVERING -> VOTING is
            // the legal edge.
            if let Err(err) = s.transition_to(ConsensusState::Voting) {
                error!(node = %s.node_id, "cannot enter VOTING: {err}");
                return ProposeAction::Drop("transition rejected");
            }
            if let Err(err) = s.begin_proposal(proposal_id, proposed_value) {
                error!(node = %s.node_id, "cannot begin proposal: {err}");
                return ProposeAction::Drop("proposal rejected");
            }
            let accept = proposed_value == s.counter + 1;
            ProposeAction::Reply {
                accept,
                reason: (!accept).then(|| format!("expected {}", s.counter + 1)),
                arm: Some(proposal_id),
            }
        });

        match action {
            ProposeAction::Reply {
                accept,
                reason,
                arm,
            } => {
                self.metrics.vote_cast();
                debug!(
                    node = %self.node_id(),
                    proposer = %source,
                    proposal = %proposal_id,
                    accept,
                    "voting"
                );
                let vote = Message::direct(
                    self.node_id().clone(),
                    source.clone(),
                    Payload::Vote {
                        proposal_id,
                        accept,
                        reason,
                    },
                );
                if let Err(err) = self.bus.send(&source, &vote).await {
                    warn!(proposer = %source, "vote not delivered: {err}");
                }
                if let Some(armed) = arm {
                    self.arm_proposal_deadline(armed);
                }
            }
            ProposeAction::Drop(why) => {
                debug!(proposal = %proposal_id, "proposal dropped: {why}");
                self.metrics.message_dropped();
            }
        }
    }

    async fn handle_vote(
        &self,
        source: NodeId,
        proposal_id: Uuid,
        accept: bool,
        reason: Option<String>,
    ) {
        if !self.is_member(&source) {
            debug!(source = %source, "vote from unknown node dropped");
            self.metrics.message_dropped();
            return;
        }

        let action = self.store.write(|s| {
            if s.consensus_state != ConsensusState::Proposing
                || s.current_proposal_id() != Some(proposal_id)
            {
                return VoteAction::Drop("vote for a proposal that is not live here");
            }
            let vote = RecordedVote {
                voter: source.clone(),
                proposal_id,
                accept,
                timestamp: Utc::now(),
                reason,
            };
            if s.record_vote(vote).is_err() {
                return VoteAction::Drop("vote rejected by state store");
            }
            let (accepts, rejects) = s.received_counts();
            let tally = VoteTally::for_proposer(accepts, rejects);
            match tally.decide(s.known_nodes.len()) {
                TallyDecision::Commit => {
                    let Some(proposal) = s.current_proposal.as_ref() else {
                        return VoteAction::Drop("proposal vanished");
                    };
                    let value = proposal.proposed_value;
                    if let Err(err) = s.transition_to(ConsensusState::Committing) {
                        error!(node = %s.node_id, "cannot enter COMMITTING: {err}");
                        return VoteAction::Drop("transition rejected");
                    }
                    s.update_counter(value);
                    VoteAction::Commit { proposal_id, value }
                }
                TallyDecision::Abort => {
                    if let Err(err) = s.transition_to(ConsensusState::Idle) {
                        error!(node = %s.node_id, "cannot abort to IDLE: {err}");
                        return VoteAction::Drop("transition rejected");
                    }
                    VoteAction::Abort { proposal_id }
                }
                TallyDecision::Wait => VoteAction::Wait,
            }
        });

        match action {
            VoteAction::Commit { proposal_id, value } => {
                self.metrics.commit_applied();
                info!(
                    node = %self.node_id(),
                    proposal = %proposal_id,
                    value,
                    "quorum reached, committing"
                );
                let commit = Message::broadcast(
                    self.node_id().clone(),
                    Payload::Commit {
                        proposal_id,
                        proposed_value: value,
                    },
                );
                let delivered = self.bus.broadcast(&commit).await;
                debug!(proposal = %proposal_id, delivered, "commit broadcast");
                // Re-validate after I/O; the proposal must still be ours.
                self.store.write(|s| {
                    if s.consensus_state == ConsensusState::Committing
                        && s.current_proposal_id() == Some(proposal_id)
                    {
                        if let Err(err) = s.transition_to(ConsensusState::Idle) {
                            warn!("commit completion transition rejected: {err}");
                        }
                    }
                });
                self.metrics.proposal_committed();
            }
            VoteAction::Abort { proposal_id } => {
                self.metrics.proposal_aborted();
                warn!(
                    node = %self.node_id(),
                    proposal = %proposal_id,
                    "majority rejected proposal, aborting"
                );
                let abort = Message::broadcast(
                    self.node_id().clone(),
                    Payload::Abort {
                        proposal_id,
                        reason: Some("majority reject".to_string()),
                    },
                );
                self.bus.broadcast(&abort).await;
            }
            VoteAction::Wait => {}
            VoteAction::Drop(why) => {
                debug!(voter = %source, proposal = %proposal_id, "vote dropped: {why}");
                self.metrics.message_dropped();
            }
        }
    }

    async fn handle_commit(&self, source: NodeId, proposal_id: Uuid, proposed_value: u64) {
        if !self.is_member(&source) {
            debug!(source = %source, "commit from unknown node dropped");
            self.metrics.message_dropped();
            return;
        }

        let action = self.store.write(|s| {
            let matches_live = s.current_proposal_id() == Some(proposal_id)
                && matches!(
                    s.consensus_state,
                    ConsensusState::Voting | ConsensusState::Committing
                );
            if matches_live {
                let applied = proposed_value > s.counter;
                if applied {
                    s.update_counter(proposed_value);
                }
                if let Err(err) = s.transition_to(ConsensusState::Idle) {
                    error!(node = %s.node_id, "commit transition rejected: {err}");
                    return CommitAction::Drop("transition rejected");
                }
                if applied {
                    CommitAction::Applied(proposed_value)
                } else {
                    CommitAction::Settled
                }
            } else if proposed_value > s.counter && !s.recovering {
                // Late delivery from a round this node missed, typically
                // around a restart. Adopt the value; recovery is not in
                // flight so nothing else owns the counter.
                s.update_counter(proposed_value);
                if s.consensus_state != ConsensusState::Idle {
                    if let Err(err) = s.transition_to(ConsensusState::Idle) {
                        error!(node = %s.node_id, "late-commit transition rejected: {err}");
                        return CommitAction::Drop("transition rejected");
                    }
                }
                CommitAction::Late(proposed_value)
            } else {
                CommitAction::Drop("stale commit")
            }
        });

        match action {
            CommitAction::Applied(value) => {
                self.metrics.commit_applied();
                info!(node = %self.node_id(), value, "commit applied");
            }
            CommitAction::Settled => {
                debug!(node = %self.node_id(), proposal = %proposal_id, "duplicate commit settled proposal");
            }
            CommitAction::Late(value) => {
                self.metrics.commit_applied();
                info!(node = %self.node_id(), value, "late commit adopted");
            }
            CommitAction::Drop(why) => {
                debug!(node = %self.node_id(), proposal = %proposal_id, "commit dropped: {why}");
                self.metrics.message_dropped();
            }
        }
    }

    async fn handle_abort(&self, source: NodeId, proposal_id: Uuid, reason: Option<String>) {
        if !self.is_member(&source) {
            debug!(source = %source, "abort from unknown node dropped");
            self.metrics.message_dropped();
            return;
        }

        let aborted = self.store.write(|s| {
            if s.current_proposal_id() == Some(proposal_id) && s.consensus_state.carries_proposal()
            {
                s.transition_to(ConsensusState::Idle).is_ok()
            } else {
                false
            }
        });
        if aborted {
            info!(
                node = %self.node_id(),
                proposal = %proposal_id,
                reason = reason.as_deref().unwrap_or("unspecified"),
                "proposal aborted by proposer"
            );
        } else {
            debug!(proposal = %proposal_id, "abort for a proposal that is not live here");
        }
    }

    async fn handle_recovery_request(&self, source: NodeId, request_id: Uuid) {
        if !self.is_member(&source) {
            debug!(source = %source, "recovery request from unknown node dropped");
            self.metrics.message_dropped();
            return;
        }

        let answer = self.store.read(|s| {
            if s.recovering {
                None
            } else {
                Some((s.counter, s.consensus_state))
            }
        });
        match answer {
            Some((counter, state)) => {
                let response = Message::direct(
                    self.node_id().clone(),
                    source.clone(),
                    Payload::RecoveryResponse {
                        request_id,
                        counter: Some(counter),
                        state,
                    },
                );
                if let Err(err) = self.bus.send(&source, &response).await {
                    warn!(requester = %source, "recovery response not delivered: {err}");
                }
            }
            None => {
                // A counter we do not trust must not weaken the requester's
                // majority; stay silent.
                debug!(requester = %source, "declining recovery request while recovering");
            }
        }
    }

    /// Arm the liveness timer for a proposal this node entered (as proposer
    /// or voter). If the proposal is still live when it fires, the node
    /// returns to IDLE and discards the in-flight votes.
    fn arm_proposal_deadline(&self, proposal_id: Uuid) {
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        let node = self.config.node_id.clone();
        let timeout = self.config.proposal_timeout;
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            let expired = store.write(|s| {
                if s.current_proposal_id() == Some(proposal_id)
                    && matches!(
                        s.consensus_state,
                        ConsensusState::Proposing | ConsensusState::Voting
                    )
                {
                    s.transition_to(ConsensusState::Idle).is_ok()
                } else {
                    false
                }
            });
            if expired {
                warn!(
                    node = %node,
                    proposal = %proposal_id,
                    "proposal deadline expired, returning to IDLE"
                );
                metrics.proposal_expired();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use countermesh_bus::{InMemoryBroker, QueueTransport};
    use std::time::Duration;

    struct Fixture {
        coordinator: ConsensusCoordinator,
        store: Arc<StateStore>,
        broker: InMemoryBroker,
        config: FederationConfig,
        _recovery_rx: mpsc::Receiver<RecoveryEvent>,
    }

    fn fixture(node: &str) -> Fixture {
        let mut config = FederationConfig::default();
        config.node_id = NodeId::new(node);
        config.send_base_backoff = Duration::from_millis(1);
        config.proposal_timeout = Duration::from_millis(50);

        let broker = InMemoryBroker::new();
        let store = Arc::new(StateStore::new(
            config.node_id.clone(),
            config.known_nodes.clone(),
        ));
        let bus = Arc::new(MessageBus::new(&config, Arc::new(broker.clone())));
        let metrics = Arc::new(ConsensusMetrics::default());
        let (tx, rx) = mpsc::channel(16);
        let coordinator = ConsensusCoordinator::new(
            config.clone(),
            store.clone(),
            bus,
            metrics,
            tx,
            CancellationToken::new(),
            TaskTracker::new(),
        );
        Fixture {
            coordinator,
            store,
            broker,
            config,
            _recovery_rx: rx,
        }
    }

    async fn first_vote(broker: &InMemoryBroker, queue: &str) -> (Uuid, bool, Option<String>) {
        let deliveries = broker
            .dequeue(queue, 10, Duration::from_millis(100))
            .await
            .unwrap();
        for delivery in deliveries {
            let message: Message = serde_json::from_slice(&delivery.body).unwrap();
            if let Payload::Vote {
                proposal_id,
                accept,
                reason,
            } = message.payload
            {
                return (proposal_id, accept, reason);
            }
        }
        panic!("no vote delivered to {queue}");
    }

    #[tokio::test]
    async fn increment_starts_a_proposal_and_broadcasts() {
        let f = fixture("n1");
        let response = f.coordinator.on_increment_request().await;
        assert!(response.success);
        assert_eq!(response.state, ConsensusState::Proposing);

        let snap = f.store.snapshot();
        assert_eq!(snap.consensus_state, ConsensusState::Proposing);
        let proposal = snap.current_proposal.unwrap();
        assert_eq!(proposal.proposed_value, 1);

        // Every peer queue got the PROPOSE; our own queue did not.
        for peer in ["n2", "n3", "n4", "n5"] {
            assert_eq!(f.broker.depth(&format!("consensus-{peer}-queue")), 1);
        }
        assert_eq!(f.broker.depth("consensus-n1-queue"), 0);
    }

    #[tokio::test]
    async fn increment_while_not_idle_reports_busy() {
        let f = fixture("n1");
        assert!(f.coordinator.on_increment_request().await.success);
        let response = f.coordinator.on_increment_request().await;
        assert!(!response.success);
        assert!(response.message.contains("busy"));
    }

    #[tokio::test]
    async fn voter_accepts_a_well_formed_proposal() {
        let f = fixture("n2");
        let proposal_id = Uuid::new_v4();
        f.coordinator
            .handle_propose(NodeId::new("n1"), proposal_id, 1)
            .await;

        let snap = f.store.snapshot();
        assert_eq!(snap.consensus_state, ConsensusState::Voting);
        assert_eq!(snap.current_proposal_id(), Some(proposal_id));

        let (id, accept, _) = first_vote(&f.broker, "consensus-n1-queue").await;
        assert_eq!(id, proposal_id);
        assert!(accept);
    }

    #[tokio::test]
    async fn voter_rejects_a_value_that_skips_ahead() {
        let f = fixture("n2");
        f.coordinator
            .handle_propose(NodeId::new("n1"), Uuid::new_v4(), 5)
            .await;

        let (_, accept, reason) = first_vote(&f.broker, "consensus-n1-queue").await;
        assert!(!accept);
        assert_eq!(reason.as_deref(), Some("expected 1"));
    }

    #[tokio::test]
    async fn busy_voter_rejects_a_second_proposal() {
        let f = fixture("n2");
        f.coordinator
            .handle_propose(NodeId::new("n1"), Uuid::new_v4(), 1)
            .await;
        // Drain the first vote.
        first_vote(&f.broker, "consensus-n1-queue").await;

        f.coordinator
            .handle_propose(NodeId::new("n3"), Uuid::new_v4(), 1)
            .await;
        let (_, accept, reason) = first_vote(&f.broker, "consensus-n3-queue").await;
        assert!(!accept);
        assert_eq!(reason.as_deref(), Some("busy"));
    }

    #[tokio::test]
    async fn quorum_of_votes_commits_and_broadcasts() {
        let f = fixture("n1");
        f.coordinator.on_increment_request().await;
        let proposal_id = f.store.snapshot().current_proposal_id().unwrap();

        f.coordinator
            .handle_vote(NodeId::new("n2"), proposal_id, true, None)
            .await;
        assert_eq!(f.store.counter(), 0);

        // Second accept: 2 received + implicit self = quorum of 3.
        f.coordinator
            .handle_vote(NodeId::new("n3"), proposal_id, true, None)
            .await;
        let snap = f.store.snapshot();
        assert_eq!(snap.counter, 1);
        assert_eq!(snap.consensus_state, ConsensusState::Idle);
        assert!(snap.current_proposal.is_none());
    }

    #[tokio::test]
    async fn majority_reject_aborts_the_proposal() {
        let f = fixture("n1");
        f.coordinator.on_increment_request().await;
        let proposal_id = f.store.snapshot().current_proposal_id().unwrap();

        f.coordinator
            .handle_vote(NodeId::new("n2"), proposal_id, false, Some("busy".into()))
            .await;
        f.coordinator
            .handle_vote(NodeId::new("n3"), proposal_id, false, Some("busy".into()))
            .await;

        let snap = f.store.snapshot();
        assert_eq!(snap.counter, 0);
        assert_eq!(snap.consensus_state, ConsensusState::Idle);
    }

    #[tokio::test]
    async fn stale_votes_are_dropped() {
        let f = fixture("n1");
        f.coordinator.on_increment_request().await;
        f.coordinator
            .handle_vote(NodeId::new("n2"), Uuid::new_v4(), true, None)
            .await;
        let snap = f.store.snapshot();
        assert!(snap.received_votes.is_empty());
    }

    #[tokio::test]
    async fn commit_is_idempotent_under_redelivery() {
        let f = fixture("n2");
        let proposal_id = Uuid::new_v4();
        f.coordinator
            .handle_propose(NodeId::new("n1"), proposal_id, 1)
            .await;
        f.coordinator
            .handle_commit(NodeId::new("n1"), proposal_id, 1)
            .await;
        assert_eq!(f.store.counter(), 1);

        // Redelivered commit: same effect as applying it once.
        f.coordinator
            .handle_commit(NodeId::new("n1"), proposal_id, 1)
            .await;
        let snap = f.store.snapshot();
        assert_eq!(snap.counter, 1);
        assert_eq!(snap.consensus_state, ConsensusState::Idle);
    }

    #[tokio::test]
    async fn commit_below_counter_is_a_no_op() {
        let f = fixture("n2");
        f.store.write(|s| s.update_counter(5));
        f.coordinator
            .handle_commit(NodeId::new("n1"), Uuid::new_v4(), 3)
            .await;
        assert_eq!(f.store.counter(), 5);
    }

    #[tokio::test]
    async fn late_commit_ahead_of_counter_is_adopted() {
        let f = fixture("n2");
        f.coordinator
            .handle_commit(NodeId::new("n1"), Uuid::new_v4(), 4)
            .await;
        let snap = f.store.snapshot();
        assert_eq!(snap.counter, 4);
        assert_eq!(snap.consensus_state, ConsensusState::Idle);
    }

    #[tokio::test]
    async fn abort_returns_voter_to_idle() {
        let f = fixture("n2");
        let proposal_id = Uuid::new_v4();
        f.coordinator
            .handle_propose(NodeId::new("n1"), proposal_id, 1)
            .await;
        f.coordinator
            .handle_abort(NodeId::new("n1"), proposal_id, Some("majority reject".into()))
            .await;
        let snap = f.store.snapshot();
        assert_eq!(snap.consensus_state, ConsensusState::Idle);
        assert_eq!(snap.counter, 0);
    }

    #[tokio::test]
    async fn proposal_deadline_returns_proposer_to_idle() {
        let f = fixture("n1");
        f.coordinator.on_increment_request().await;
        assert_eq!(
            f.store.snapshot().consensus_state,
            ConsensusState::Proposing
        );

        // No votes arrive; the deadline (50ms in this fixture) must fire.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let snap = f.store.snapshot();
        assert_eq!(snap.consensus_state, ConsensusState::Idle);
        assert!(snap.current_proposal.is_none());
    }

    #[tokio::test]
    async fn messages_from_unknown_nodes_are_ignored() {
        let f = fixture("n1");
        f.coordinator
            .handle_commit(NodeId::new("stranger"), Uuid::new_v4(), 9)
            .await;
        assert_eq!(f.store.counter(), 0);

        f.coordinator
            .handle_propose(NodeId::new("stranger"), Uuid::new_v4(), 1)
            .await;
        assert_eq!(f.store.snapshot().consensus_state, ConsensusState::Idle);
    }

    #[tokio::test]
    async fn recovery_request_is_answered_with_current_counter() {
        let f = fixture("n2");
        f.store.write(|s| s.update_counter(7));
        let request_id = Uuid::new_v4();
        f.coordinator
            .handle_recovery_request(NodeId::new("n4"), request_id)
            .await;

        let deliveries = f
            .broker
            .dequeue("consensus-n4-queue", 10, Duration::from_millis(100))
            .await
            .unwrap();
        let message: Message = serde_json::from_slice(&deliveries[0].body).unwrap();
        match message.payload {
            Payload::RecoveryResponse {
                request_id: id,
                counter,
                ..
            } => {
                assert_eq!(id, request_id);
                assert_eq!(counter, Some(7));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovering_node_declines_recovery_requests() {
        let f = fixture("n2");
        f.store.write(|s| s.set_recovering(true));
        f.coordinator
            .handle_recovery_request(NodeId::new("n4"), Uuid::new_v4())
            .await;
        assert_eq!(f.broker.depth("consensus-n4-queue"), 0);
    }

    #[tokio::test]
    async fn recovering_node_votes_reject_without_state_change() {
        let f = fixture("n2");
        f.store.write(|s| {
            s.set_recovering(true);
            s.transition_to(ConsensusState::Recovering).unwrap();
        });
        f.coordinator
            .handle_propose(NodeId::new("n1"), Uuid::new_v4(), 1)
            .await;

        let snap = f.store.snapshot();
        assert_eq!(snap.consensus_state, ConsensusState::Recovering);
        let (_, accept, reason) = first_vote(&f.broker, "consensus-n1-queue").await;
        assert!(!accept);
        assert_eq!(reason.as_deref(), Some("recovering"));
    }

    #[tokio::test]
    async fn config_queue_template_drives_fixture_queues() {
        let f = fixture("n1");
        assert_eq!(
            f.config.queue_name(&NodeId::new("n1")),
            "consensus-n1-queue"
        );
    }
}
