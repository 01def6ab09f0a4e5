//! State store: the single source of truth for one node's consensus data.
//!
//! All reads and mutations of [`NodeState`] pass through [`StateStore`],
//! which serializes them behind a reader-writer lock. Compound protocol
//! decisions run inside one [`StateStore::write`] closure and return the
//! I/O to perform; network calls are never made under the lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use countermesh_core::{ConsensusState, NodeId};

/// Rejected state-store operations. Expected protocol events (stale votes,
/// illegal transitions) are values, not panics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid consensus transition {from} -> {to}")]
    InvalidTransition {
        from: ConsensusState,
        to: ConsensusState,
    },

    #[error("no proposal is live")]
    NoLiveProposal,

    #[error("vote addresses stale proposal {proposal_id}")]
    StaleVote { proposal_id: Uuid },

    #[error("voter id must be non-empty")]
    EmptyVoter,

    #[error("voter {0} is not a federation member")]
    UnknownVoter(NodeId),

    #[error("cannot begin a proposal while {0}")]
    NotAcceptingProposal(ConsensusState),
}

/// The proposal currently live on this node.
///
/// On the proposer this tracks the value being driven to quorum; on a voter
/// it pins the id the node is committed to answering for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalRecord {
    pub id: Uuid,
    pub proposed_value: u64,
    pub started_at: DateTime<Utc>,
}

/// One vote as recorded by the proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedVote {
    pub voter: NodeId,
    pub proposal_id: Uuid,
    pub accept: bool,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Complete per-node consensus state.
///
/// Mutated only through its methods, which enforce the transition table and
/// the proposal/vote invariants. [`StateStore::snapshot`] hands out
/// immutable copies.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub node_id: NodeId,
    pub counter: u64,
    pub consensus_state: ConsensusState,
    pub known_nodes: Vec<NodeId>,
    pub current_proposal: Option<ProposalRecord>,
    pub received_votes: HashMap<NodeId, RecordedVote>,
    pub last_heartbeat: DateTime<Utc>,
    pub recovering: bool,
    /// Set when recovery exhausted its attempts; the node then refuses to
    /// initiate proposals until restarted.
    pub recovery_failed: bool,
}

impl NodeState {
    pub fn new(node_id: NodeId, known_nodes: Vec<NodeId>) -> Self {
        Self {
            node_id,
            counter: 0,
            consensus_state: ConsensusState::Idle,
            known_nodes,
            current_proposal: None,
            received_votes: HashMap::new(),
            last_heartbeat: Utc::now(),
            recovering: false,
            recovery_failed: false,
        }
    }

    pub fn current_proposal_id(&self) -> Option<Uuid> {
        self.current_proposal.as_ref().map(|p| p.id)
    }

    /// Accept/reject counts among the received votes (the proposer's own
    /// implicit accept is not stored here; the tally adds it).
    pub fn received_counts(&self) -> (usize, usize) {
        let accepts = self.received_votes.values().filter(|v| v.accept).count();
        (accepts, self.received_votes.len() - accepts)
    }

    /// Move along the transition table, applying state-entry side effects.
    /// Illegal edges are rejected with no change at all.
    pub fn transition_to(&mut self, to: ConsensusState) -> Result<ConsensusState, StateError> {
        let from = self.consensus_state;
        if !from.may_transition_to(to) {
            return Err(StateError::InvalidTransition { from, to });
        }
        self.consensus_state = to;
        match to {
            // Entering IDLE or RECOVERING destroys any proposal context.
            ConsensusState::Idle | ConsensusState::Recovering => {
                self.current_proposal = None;
                self.received_votes.clear();
            }
            // Entering a proposal-carrying state starts from a clean slate;
            // begin_proposal installs the new id right after.
            ConsensusState::Proposing | ConsensusState::Voting => {
                self.current_proposal = None;
                self.received_votes.clear();
            }
            ConsensusState::Committing => {}
        }
        Ok(to)
    }

    /// Install a fresh proposal. Legal only while PROPOSING or VOTING.
    pub fn begin_proposal(&mut self, id: Uuid, proposed_value: u64) -> Result<(), StateError> {
        if !matches!(
            self.consensus_state,
            ConsensusState::Proposing | ConsensusState::Voting
        ) {
            return Err(StateError::NotAcceptingProposal(self.consensus_state));
        }
        self.current_proposal = Some(ProposalRecord {
            id,
            proposed_value,
            started_at: Utc::now(),
        });
        self.received_votes.clear();
        Ok(())
    }

    /// Record a vote for the live proposal. A later vote from the same
    /// voter replaces the earlier one. Returns the updated vote count.
    pub fn record_vote(&mut self, vote: RecordedVote) -> Result<usize, StateError> {
        if vote.voter.is_empty() {
            return Err(StateError::EmptyVoter);
        }
        if !self.known_nodes.contains(&vote.voter) {
            return Err(StateError::UnknownVoter(vote.voter));
        }
        let current = self.current_proposal_id().ok_or(StateError::NoLiveProposal)?;
        if vote.proposal_id != current {
            return Err(StateError::StaleVote {
                proposal_id: vote.proposal_id,
            });
        }
        self.received_votes.insert(vote.voter.clone(), vote);
        Ok(self.received_votes.len())
    }

    /// Overwrite the counter. Monotonicity is the coordinator's rule
    /// (recovery legitimately jumps forward); the store only records.
    pub fn update_counter(&mut self, new: u64) {
        self.counter = new;
    }

    /// Flip the recovering flag. Setting it clears proposal context so a
    /// recovering node can never hold a live proposal.
    pub fn set_recovering(&mut self, recovering: bool) {
        self.recovering = recovering;
        if recovering {
            self.current_proposal = None;
            self.received_votes.clear();
        }
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }
}

/// Serialized access to one node's [`NodeState`].
///
/// Every operation is atomic with respect to every other; readers never
/// observe torn state. Callers must not perform network I/O inside the
/// closures passed to [`read`](Self::read) / [`write`](Self::write).
pub struct StateStore {
    inner: RwLock<NodeState>,
}

impl StateStore {
    pub fn new(node_id: NodeId, known_nodes: Vec<NodeId>) -> Self {
        Self {
            inner: RwLock::new(NodeState::new(node_id, known_nodes)),
        }
    }

    pub fn counter(&self) -> u64 {
        self.inner.read().counter
    }

    /// Immutable copy of the entire state.
    pub fn snapshot(&self) -> NodeState {
        self.inner.read().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&NodeState) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        f(&mut self.inner.write())
    }
}
