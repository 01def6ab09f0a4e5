//! Vote tally: the pure quorum decision.
//!
//! Counting is deliberately free of I/O and state so the rule can be tested
//! exhaustively. A strict majority is required; exact ties are not
//! majorities.

use countermesh_core::quorum;

/// Outcome of evaluating the votes for one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyDecision {
    /// Enough accepts: apply and broadcast COMMIT.
    Commit,
    /// Enough votes, but the accepts do not outnumber the rejects.
    Abort,
    /// Not decided yet; keep collecting until the proposal deadline.
    Wait,
}

/// Accept/reject counts for one proposal, the proposer's own accept
/// included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteTally {
    pub accepts: usize,
    pub rejects: usize,
}

impl VoteTally {
    /// Build a tally from the votes received over the wire plus the
    /// proposer's implicit accept.
    pub fn for_proposer(received_accepts: usize, received_rejects: usize) -> Self {
        Self {
            accepts: received_accepts + 1,
            rejects: received_rejects,
        }
    }

    pub fn total(&self) -> usize {
        self.accepts + self.rejects
    }

    /// Whether the accepts alone form a quorum of the federation.
    pub fn accept_quorum(&self, federation_size: usize) -> bool {
        self.accepts >= quorum(federation_size)
    }

    /// Decide the proposal:
    /// COMMIT iff the accepts form a quorum and strictly outnumber the
    /// rejects; ABORT iff a quorum of votes is in but the accepts do not
    /// outnumber the rejects; WAIT otherwise.
    pub fn decide(&self, federation_size: usize) -> TallyDecision {
        let quorum = quorum(federation_size);
        if self.accepts >= quorum && self.accepts > self.rejects {
            TallyDecision::Commit
        } else if self.total() >= quorum && self.accepts <= self.rejects {
            TallyDecision::Abort
        } else {
            TallyDecision::Wait
        }
    }
}
