//! Node identity, consensus states, and quorum arithmetic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier for a node in the federation.
///
/// Node ids are non-empty strings chosen by the operator; the protocol never
/// interprets their contents. Queue names are derived from them via the
/// configured prefix template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-node consensus state.
///
/// A node is in exactly one of these states at any moment. The legal
/// transitions form a fixed table enforced by the state store; every other
/// edge is rejected without a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusState {
    /// No proposal in flight; the node may become a proposer or a voter.
    Idle,
    /// This node originated a proposal and is collecting votes.
    Proposing,
    /// This node voted on a peer's proposal and awaits COMMIT or ABORT.
    Voting,
    /// A quorum was reached and the commit is being applied and broadcast.
    Committing,
    /// The node is reconstructing its counter from a quorum of live peers.
    Recovering,
}

impl ConsensusState {
    /// Whether the edge `self -> to` is in the allowed transition table.
    pub fn may_transition_to(self, to: ConsensusState) -> bool {
        use ConsensusState::*;
        matches!(
            (self, to),
            (Idle, Proposing)
                | (Idle, Voting)
                | (Idle, Recovering)
                | (Proposing, Committing)
                | (Proposing, Idle)
                | (Proposing, Recovering)
                | (Voting, Committing)
                | (Voting, Idle)
                | (Voting, Recovering)
                | (Committing, Idle)
                | (Committing, Recovering)
                | (Recovering, Idle)
                | (Recovering, Voting)
                | (Recovering, Proposing)
        )
    }

    /// States in which a proposal id may be live on this node.
    pub fn carries_proposal(self) -> bool {
        matches!(
            self,
            ConsensusState::Proposing | ConsensusState::Voting | ConsensusState::Committing
        )
    }
}

impl fmt::Display for ConsensusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusState::Idle => "IDLE",
            ConsensusState::Proposing => "PROPOSING",
            ConsensusState::Voting => "VOTING",
            ConsensusState::Committing => "COMMITTING",
            ConsensusState::Recovering => "RECOVERING",
        };
        f.write_str(name)
    }
}

/// Minimum number of agreeing peers regardless of federation size.
///
/// Recovery additionally requires at least this many responses, and a
/// federation smaller than this is rejected at configuration time.
pub const QUORUM_FLOOR: usize = 3;

/// Quorum size for a federation of `n` nodes: `⌊n/2⌋ + 1`, never below
/// [`QUORUM_FLOOR`].
pub fn quorum(n: usize) -> usize {
    (n / 2 + 1).max(QUORUM_FLOOR)
}
