//! Wire schema for inter-node messages.
//!
//! Messages are self-describing JSON records. The kind discriminator is the
//! `type` field of the flattened [`Payload`]; correlation ids, values, and
//! vote fields only exist on the kinds that carry them, which the tagged
//! representation enforces at decode time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use countermesh_core::{ConsensusState, NodeId};

/// One message on the wire: routing envelope plus protocol payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Node that produced the message.
    pub source_node_id: NodeId,

    /// Addressed recipient; `None` for broadcast fan-out copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<NodeId>,

    /// Send timestamp, diagnostic only.
    pub sent_at: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: Payload,

    /// Free-form diagnostic tags. Never interpreted by the protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl Message {
    /// Point-to-point message to a single peer.
    pub fn direct(source: NodeId, target: NodeId, payload: Payload) -> Self {
        Self {
            source_node_id: source,
            target_node_id: Some(target),
            sent_at: Utc::now(),
            payload,
            metadata: None,
        }
    }

    /// Message intended for every peer; the adapter enqueues one copy per
    /// known peer queue.
    pub fn broadcast(source: NodeId, payload: Payload) -> Self {
        Self {
            source_node_id: source,
            target_node_id: None,
            sent_at: Utc::now(),
            payload,
            metadata: None,
        }
    }
}

/// The seven message kinds of the counter protocol.
///
/// Internally tagged so each kind decodes only the fields it defines.
/// Handlers dispatch with an exhaustive `match`; a new kind will not compile
/// until every dispatch site handles it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    /// External trigger asking the receiving node to propose an increment.
    IncrementRequest,

    /// Proposer asks the federation to move the counter to `proposed_value`.
    #[serde(rename_all = "camelCase")]
    Propose {
        proposal_id: Uuid,
        proposed_value: u64,
    },

    /// Voter's answer to a PROPOSE, sent to the proposer only.
    #[serde(rename_all = "camelCase")]
    Vote {
        proposal_id: Uuid,
        accept: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Proposer announces that `proposal_id` reached quorum at
    /// `proposed_value`; receivers apply it.
    #[serde(rename_all = "camelCase")]
    Commit {
        proposal_id: Uuid,
        proposed_value: u64,
    },

    /// Proposer abandons `proposal_id`. Optional; voters also time out on
    /// their own.
    #[serde(rename_all = "camelCase")]
    Abort {
        proposal_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A restarted node asks a peer for its current counter.
    #[serde(rename_all = "camelCase")]
    RecoveryRequest { request_id: Uuid },

    /// Answer to a RECOVERY_REQUEST. `counter` is `None` when the responder
    /// cannot vouch for its own value; requesters drop such responses.
    #[serde(rename_all = "camelCase")]
    RecoveryResponse {
        request_id: Uuid,
        counter: Option<u64>,
        state: ConsensusState,
    },
}

impl Payload {
    /// Wire name of the kind, for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::IncrementRequest => "INCREMENT_REQUEST",
            Payload::Propose { .. } => "PROPOSE",
            Payload::Vote { .. } => "VOTE",
            Payload::Commit { .. } => "COMMIT",
            Payload::Abort { .. } => "ABORT",
            Payload::RecoveryRequest { .. } => "RECOVERY_REQUEST",
            Payload::RecoveryResponse { .. } => "RECOVERY_RESPONSE",
        }
    }
}

/// Reply handed back to the external increment trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    /// Whether a proposal was started on the trigger's behalf.
    pub success: bool,
    /// The node's counter at the time of the reply.
    pub current_value: Option<u64>,
    pub node_id: NodeId,
    /// Human-readable outcome ("proposal started", "busy: VOTING", ...).
    pub message: String,
    pub state: ConsensusState,
}
