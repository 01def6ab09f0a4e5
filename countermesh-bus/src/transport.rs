//! Queue transport contract consumed by the message bus.
//!
//! The core assumes a reliable point-to-point queue per node: at-least-once
//! delivery, arbitrary reordering and duplication, no ordering across
//! senders. Messages pulled from a queue stay invisible until acknowledged;
//! unacked deliveries reappear after a transport-controlled visibility
//! interval.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transient fault; the caller may retry with backoff.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The named queue does not exist at the endpoint.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// Message bytes could not be produced or parsed. Not retryable.
    #[error("codec failure: {0}")]
    Codec(String),

    /// The transport was shut down.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// Opaque handle for acknowledging one delivery.
///
/// Tokens are minted by the transport on dequeue and must be passed back
/// verbatim; consumers never inspect them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken {
    pub(crate) queue: String,
    pub(crate) id: u64,
}

/// One message pulled from a queue, paired with its ack token.
#[derive(Debug)]
pub struct Delivery {
    pub token: DeliveryToken,
    pub body: Vec<u8>,
}

/// Reliable per-node queue transport.
///
/// Implementations must be safe for concurrent use: the outbound worker pool
/// enqueues from many tasks while the dispatcher dequeues.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Append `body` to `queue`. Returns once the transport has accepted the
    /// message; delivery is at-least-once from that point.
    async fn enqueue(&self, queue: &str, body: Vec<u8>) -> Result<(), TransportError>;

    /// Pull up to `max` messages from `queue`, blocking up to `wait` when
    /// the queue is empty. May return fewer than `max`, including zero.
    async fn dequeue(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError>;

    /// Acknowledge a delivery so it is not redelivered. Acking an already
    /// expired or unknown token is a no-op.
    async fn ack(&self, token: &DeliveryToken) -> Result<(), TransportError>;
}
