//! # countermesh Consensus Engine
//!
//! The replicated state machine at the center of the federation: a single
//! monotonically increasing counter advanced one unit at a time by
//! single-decree quorum agreement.
//!
//! ## Components
//!
//! - [`store`]: the State Store, one guarded [`NodeState`](store::NodeState)
//!   per node, the sole holder of the counter, the consensus state machine,
//!   the live proposal, and the received votes. Transition legality and
//!   state-entry side effects are enforced here; illegal edges are rejected
//!   without a state change.
//! - [`tally`]: the pure vote-tally function. Given accept/reject counts
//!   (the proposer's own accept included) and the federation size, decide
//!   COMMIT, ABORT, or WAIT.
//! - [`recovery`]: the protocol a freshly started node runs to adopt the
//!   federation's current counter from a quorum of live peers. Request
//!   rounds, a three-response floor, majority adoption with a max-observed
//!   tie-break, and bounded retries.
//! - [`coordinator`]: the per-proposal state machine. Drives
//!   PROPOSE → VOTE → COMMIT, arbitrates concurrent proposals, applies
//!   commits, and arms the proposal deadlines that guarantee liveness.
//! - [`node`]: task wiring. The serial inbound dispatcher, the external
//!   increment trigger entry point, heartbeat and deadline timers, and
//!   cancellation-token shutdown with a bounded grace period.
//!
//! ## Concurrency discipline
//!
//! All consensus decisions are computed while holding the state store's
//! write lock and describe the network I/O to perform; the I/O itself
//! happens strictly after the lock is released. Handlers that re-enter the
//! lock after I/O re-validate their preconditions, so a message arriving
//! in the gap cannot corrupt the proposal bookkeeping.

pub mod coordinator;
pub mod metrics;
pub mod node;
pub mod recovery;
pub mod store;
pub mod tally;

pub use coordinator::ConsensusCoordinator;
pub use metrics::{ConsensusMetrics, MetricsSnapshot};
pub use node::{FederationNode, NodeOptions};
pub use recovery::{RecoveryCoordinator, RecoveryEvent, RecoveryResult};
pub use store::{NodeState, ProposalRecord, RecordedVote, StateError, StateStore};
pub use tally::{TallyDecision, VoteTally};
