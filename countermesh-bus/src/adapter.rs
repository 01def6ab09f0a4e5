//! Message bus adapter: the send/broadcast/poll/ack surface the consensus
//! layer drives.
//!
//! Outbound sends retry transient transport faults with bounded exponential
//! backoff under a hard deadline; exhaustion surfaces as a transport error
//! that the consensus layer treats as silence from that peer, never as a
//! reject. Broadcast fans out through a bounded worker pool and tolerates
//! per-peer failures. Inbound messages that cannot be decoded are
//! acknowledged immediately so a poison message cannot wedge the queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use countermesh_core::{FederationConfig, NodeId};

use crate::protocol::Message;
use crate::transport::{DeliveryToken, QueueTransport, TransportError};

/// How many peer sends a single broadcast runs concurrently.
const BROADCAST_POOL: usize = 8;

/// One inbound message paired with the delivery token used to acknowledge
/// it after processing. Keeping the token outside the protocol envelope
/// means it can never leak into message metadata.
#[derive(Debug)]
pub struct InboundMessage {
    pub message: Message,
    pub token: DeliveryToken,
}

/// Typed messaging surface bound to one node's identity.
///
/// Owns the queue-name derivation for the whole federation; callers address
/// peers by [`NodeId`] only.
pub struct MessageBus {
    node_id: NodeId,
    transport: Arc<dyn QueueTransport>,
    queue_names: HashMap<NodeId, String>,
    own_queue: String,
    send_max_retries: u32,
    send_base_backoff: Duration,
    send_deadline: Duration,
}

impl MessageBus {
    pub fn new(config: &FederationConfig, transport: Arc<dyn QueueTransport>) -> Self {
        let queue_names = config
            .known_nodes
            .iter()
            .map(|node| (node.clone(), config.queue_name(node)))
            .collect::<HashMap<_, _>>();
        let own_queue = config.queue_name(&config.node_id);
        Self {
            node_id: config.node_id.clone(),
            transport,
            queue_names,
            own_queue,
            send_max_retries: config.send_max_retries,
            send_base_backoff: config.send_base_backoff,
            send_deadline: config.send_deadline,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Send one message to `target`, retrying transient transport faults
    /// with exponential backoff until the retry budget or the hard deadline
    /// runs out.
    pub async fn send(&self, target: &NodeId, message: &Message) -> Result<(), TransportError> {
        let queue = self
            .queue_names
            .get(target)
            .ok_or_else(|| TransportError::UnknownQueue(target.to_string()))?;
        let body =
            serde_json::to_vec(message).map_err(|e| TransportError::Codec(e.to_string()))?;

        let attempt_all = async {
            let mut backoff = self.send_base_backoff;
            let mut attempt = 0u32;
            loop {
                match self.transport.enqueue(queue, body.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_transient() && attempt < self.send_max_retries => {
                        attempt += 1;
                        warn!(
                            target = %target,
                            attempt,
                            kind = message.payload.kind(),
                            "send failed, backing off: {err}"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        match tokio::time::timeout(self.send_deadline, attempt_all).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Unavailable(format!(
                "send to {target} exceeded {:?} deadline",
                self.send_deadline
            ))),
        }
    }

    /// Send `message` to every known peer except this node. Per-peer
    /// failures are logged and skipped; returns how many peers the
    /// transport accepted.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let peers: Vec<&NodeId> = self
            .queue_names
            .keys()
            .filter(|node| **node != self.node_id)
            .collect();

        stream::iter(peers)
            .map(|peer: &NodeId| async move {
                match self.send(peer, message).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(
                            peer = %peer,
                            kind = message.payload.kind(),
                            "broadcast delivery skipped: {err}"
                        );
                        false
                    }
                }
            })
            .buffer_unordered(BROADCAST_POOL)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await
    }

    /// Pull up to `max_batch` messages addressed to this node, blocking up
    /// to `wait`. Undecodable messages are acked and dropped here.
    pub async fn poll(
        &self,
        max_batch: usize,
        wait: Duration,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let deliveries = self.transport.dequeue(&self.own_queue, max_batch, wait).await?;
        let mut inbound = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            match serde_json::from_slice::<Message>(&delivery.body) {
                Ok(message) => inbound.push(InboundMessage {
                    message,
                    token: delivery.token,
                }),
                Err(err) => {
                    warn!(queue = %self.own_queue, "dropping undecodable message: {err}");
                    // Ack the poison message so it is not redelivered forever.
                    self.transport.ack(&delivery.token).await?;
                }
            }
        }
        Ok(inbound)
    }

    /// Acknowledge a fully processed message.
    pub async fn ack(&self, token: &DeliveryToken) -> Result<(), TransportError> {
        debug!(queue = %token.queue, "ack");
        self.transport.ack(token).await
    }
}
