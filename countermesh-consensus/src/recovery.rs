//! Recovery: how a restarted node learns the federation's counter.
//!
//! NodeState is not persisted, so a restarted node boots at zero and must
//! not take proposer or voter duties until it has adopted the current
//! counter from a live quorum. The protocol runs in rounds: fan a
//! RECOVERY_REQUEST out to every peer, collect correlated responses until
//! the deadline, then adopt the value a majority of responders report, or
//! the maximum observed value when no strict majority exists.
//!
//! Peers that are themselves recovering decline to answer; a counter they
//! do not trust must not weaken the requester's majority.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use countermesh_bus::{Message, MessageBus, Payload};
use countermesh_core::{quorum, ConsensusState, FederationConfig, NodeId, QUORUM_FLOOR};

use crate::metrics::ConsensusMetrics;
use crate::store::StateStore;

/// A RECOVERY_RESPONSE routed in from the dispatcher.
#[derive(Debug, Clone)]
pub struct RecoveryEvent {
    pub responder: NodeId,
    pub request_id: Uuid,
    pub counter: Option<u64>,
}

/// Terminal outcome of the recovery protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryResult {
    Adopted { value: u64, majority: bool },
    Failed,
}

/// The counter value chosen from one round's responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adoption {
    pub value: u64,
    /// False when the value was chosen by the max-observed tie-break.
    pub majority: bool,
    pub responses: usize,
}

/// Choose the counter to adopt from one round's responses.
///
/// Fewer than [`QUORUM_FLOOR`] responses fail the round outright. With
/// enough responses, a value reported by a strict majority of responders
/// wins; otherwise the maximum observed value does. The majority threshold
/// carries the same floor of three as the quorum itself, so two agreeing
/// responders out of three never outvote a higher committed value.
pub fn select_counter(responses: &HashMap<NodeId, u64>) -> Option<Adoption> {
    let total = responses.len();
    if total < QUORUM_FLOOR {
        return None;
    }

    let mut frequency: HashMap<u64, usize> = HashMap::new();
    for value in responses.values() {
        *frequency.entry(*value).or_insert(0) += 1;
    }

    let threshold = (total / 2 + 1).max(QUORUM_FLOOR);
    if let Some((value, _)) = frequency.iter().find(|(_, count)| **count >= threshold) {
        return Some(Adoption {
            value: *value,
            majority: true,
            responses: total,
        });
    }

    // No strict majority: converge on the highest value anyone committed.
    let max = responses.values().copied().max()?;
    Some(Adoption {
        value: max,
        majority: false,
        responses: total,
    })
}

/// Runs the recovery protocol once per process start.
pub struct RecoveryCoordinator {
    config: FederationConfig,
    store: Arc<StateStore>,
    bus: Arc<MessageBus>,
    metrics: Arc<ConsensusMetrics>,
    responses: mpsc::Receiver<RecoveryEvent>,
}

impl RecoveryCoordinator {
    pub fn new(
        config: FederationConfig,
        store: Arc<StateStore>,
        bus: Arc<MessageBus>,
        metrics: Arc<ConsensusMetrics>,
        responses: mpsc::Receiver<RecoveryEvent>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            metrics,
            responses,
        }
    }

    /// Drive rounds until the counter is adopted, the attempt budget runs
    /// out, or shutdown is requested.
    pub async fn run(mut self, cancel: CancellationToken) -> RecoveryResult {
        info!(node = %self.config.node_id, "entering recovery");
        self.store.write(|s| {
            s.set_recovering(true);
            if let Err(err) = s.transition_to(ConsensusState::Recovering) {
                // Only reachable if the node was mid-proposal at boot, which
                // the startup ordering rules out.
                warn!("recovery entry transition rejected: {err}");
            }
        });

        for attempt in 1..=self.config.max_recovery_attempts {
            if cancel.is_cancelled() {
                break;
            }
            match self.round(attempt, &cancel).await {
                Some(adoption) => {
                    self.store.write(|s| {
                        s.update_counter(adoption.value);
                        s.set_recovering(false);
                        if let Err(err) = s.transition_to(ConsensusState::Idle) {
                            warn!("recovery exit transition rejected: {err}");
                        }
                    });
                    if adoption.majority {
                        info!(
                            node = %self.config.node_id,
                            value = adoption.value,
                            responses = adoption.responses,
                            "recovery adopted majority counter"
                        );
                    } else {
                        warn!(
                            node = %self.config.node_id,
                            value = adoption.value,
                            responses = adoption.responses,
                            "recovery tie-break: no strict majority, adopting max observed"
                        );
                        self.metrics.recovery_tiebreak();
                    }
                    self.metrics.recovery_completed();
                    return RecoveryResult::Adopted {
                        value: adoption.value,
                        majority: adoption.majority,
                    };
                }
                None if attempt < self.config.max_recovery_attempts => {
                    warn!(
                        node = %self.config.node_id,
                        attempt,
                        "recovery round failed, retrying in {:?}",
                        self.config.recovery_retry_interval
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.recovery_retry_interval) => {}
                    }
                }
                None => {}
            }
        }

        // Out of attempts: stay live, keep answering peers, refuse to
        // initiate proposals until restarted.
        warn!(node = %self.config.node_id, "recovery failed after all attempts");
        self.store.write(|s| {
            s.set_recovering(false);
            s.recovery_failed = true;
            if let Err(err) = s.transition_to(ConsensusState::Idle) {
                warn!("recovery exit transition rejected: {err}");
            }
        });
        self.metrics.recovery_failed();
        RecoveryResult::Failed
    }

    /// One request/collect round. Returns the adoption when the round
    /// produced one.
    async fn round(&mut self, attempt: u32, cancel: &CancellationToken) -> Option<Adoption> {
        let request_id = Uuid::new_v4();

        // Responses from earlier rounds are stale by construction.
        while self.responses.try_recv().is_ok() {}

        let mut sent = 0usize;
        for peer in self.config.peers() {
            let message = Message::direct(
                self.config.node_id.clone(),
                peer.clone(),
                Payload::RecoveryRequest { request_id },
            );
            match self.bus.send(peer, &message).await {
                Ok(()) => sent += 1,
                Err(err) => debug!(peer = %peer, "recovery request not delivered: {err}"),
            }
        }
        debug!(
            node = %self.config.node_id,
            attempt,
            sent,
            "recovery round started"
        );
        if sent == 0 {
            return None;
        }

        let federation_size = self.config.federation_size();
        let deadline = tokio::time::Instant::now() + self.config.recovery_timeout;
        let mut collected: HashMap<NodeId, u64> = HashMap::new();

        loop {
            // Enough responders to decide structurally: stop early.
            if collected.len() >= QUORUM_FLOOR && collected.len() + 1 >= quorum(federation_size) {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let event = tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => break,
                event = self.responses.recv() => event?,
            };
            if event.request_id != request_id {
                debug!(responder = %event.responder, "stale recovery response dropped");
                continue;
            }
            if !self.config.known_nodes.contains(&event.responder) {
                // Unknown responders never count toward the majority.
                debug!(responder = %event.responder, "recovery response from unknown node dropped");
                continue;
            }
            let Some(counter) = event.counter else {
                debug!(responder = %event.responder, "null-counter recovery response dropped");
                continue;
            };
            // Latest response per responder wins.
            collected.insert(event.responder, counter);
        }

        select_counter(&collected)
    }
}
