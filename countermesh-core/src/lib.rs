//! # countermesh Core Types and Configuration
//!
//! Shared foundation for the countermesh federation: node identity, the
//! consensus state machine vocabulary, quorum arithmetic, and the federation
//! configuration surface.
//!
//! The federation is a fixed set of peer nodes that cooperatively maintain a
//! single monotonically increasing counter. Every other crate in the
//! workspace builds on the types defined here:
//!
//! - `countermesh-bus` carries [`NodeId`] and [`ConsensusState`] on the wire
//! - `countermesh-consensus` drives the [`ConsensusState`] machine and uses
//!   [`quorum`] to decide when a proposal or a recovery round has enough
//!   agreement
//! - the node host and CLI load and validate [`FederationConfig`]
//!
//! Configuration follows a file-plus-defaults model: a JSON config file is
//! loaded when present, otherwise defaults are written out for the operator
//! to edit. Validation is fatal at startup (a federation smaller than three
//! nodes cannot form a quorum and is rejected outright).

pub mod config;
pub mod types;

pub use config::FederationConfig;
pub use types::{quorum, ConsensusState, NodeId, QUORUM_FLOOR};
