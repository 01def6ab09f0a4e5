//! Federation configuration loading and validation.
//!
//! Follows a file-plus-defaults model: [`FederationConfig::load`] reads a
//! JSON config file when one exists and otherwise writes the defaults out so
//! a new installation starts from a known-good template. Validation failures
//! are fatal at startup; a node with a malformed federation definition must
//! not join the protocol.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::types::{NodeId, QUORUM_FLOOR};

/// Complete configuration for one federation node.
///
/// Every node in a federation must agree on `known_nodes` and
/// `queue_name_prefix`; queue names for each peer are derived from those two
/// values, so a mismatch silently partitions the federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// This node's identifier. Required, non-empty, and listed in
    /// `known_nodes`.
    pub node_id: NodeId,

    /// Full federation membership including this node. Fixed for the
    /// lifetime of the federation; size must be at least three.
    pub known_nodes: Vec<NodeId>,

    /// Transport endpoint address handed to the queue transport
    /// implementation (broker URL, region, or similar).
    pub queue_endpoint: String,

    /// Prefix for the per-node queue name template
    /// `"<prefix>-<node_id>-queue"`.
    pub queue_name_prefix: String,

    /// How long a proposer or voter waits for a proposal to resolve before
    /// abandoning it and returning to IDLE.
    pub proposal_timeout: Duration,

    /// How long one recovery round waits for responses.
    pub recovery_timeout: Duration,

    /// Pause between failed recovery rounds.
    pub recovery_retry_interval: Duration,

    /// Number of recovery rounds attempted before the node gives up and
    /// surfaces a recovery-failed condition.
    pub max_recovery_attempts: u32,

    /// Retries for a single point-to-point send on transient transport
    /// errors, with exponential backoff.
    pub send_max_retries: u32,

    /// Base backoff for send retries; doubles per attempt.
    pub send_base_backoff: Duration,

    /// Hard deadline on any single outbound send, including retries.
    pub send_deadline: Duration,

    /// Maximum messages pulled per poll.
    pub poll_max_batch: usize,

    /// Maximum time one poll blocks waiting for messages.
    pub poll_wait: Duration,

    /// Grace period for draining outbound work during shutdown.
    pub shutdown_grace: Duration,

    /// Log level filter applied when the host initializes logging
    /// (overridable through the environment).
    pub log_level: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("n1"),
            known_nodes: ["n1", "n2", "n3", "n4", "n5"]
                .into_iter()
                .map(NodeId::from)
                .collect(),
            queue_endpoint: "memory://local".to_string(),
            queue_name_prefix: "consensus".to_string(),
            proposal_timeout: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(10),
            recovery_retry_interval: Duration::from_secs(30),
            max_recovery_attempts: 3,
            send_max_retries: 3,
            send_base_backoff: Duration::from_millis(100),
            send_deadline: Duration::from_secs(30),
            poll_max_batch: 10,
            poll_wait: Duration::from_secs(20),
            shutdown_grace: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }
}

impl FederationConfig {
    /// Load configuration from `path`, or create and persist the defaults if
    /// the file does not exist yet.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let config: Self = serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse config {}", path.display()))?;
                config.validate()?;
                Ok(config)
            }
            Err(_) => {
                let config = Self::default();
                config.save(path).await?;
                Ok(config)
            }
        }
    }

    /// Persist this configuration as pretty-printed JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path.as_ref(), content)
            .await
            .with_context(|| format!("failed to write config {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Validate the configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            bail!("node_id must be non-empty");
        }
        if self.known_nodes.len() < QUORUM_FLOOR {
            bail!(
                "federation requires at least {} nodes, got {}",
                QUORUM_FLOOR,
                self.known_nodes.len()
            );
        }
        if !self.known_nodes.contains(&self.node_id) {
            bail!("known_nodes must include this node ({})", self.node_id);
        }
        let mut seen = HashSet::new();
        for node in &self.known_nodes {
            if node.is_empty() {
                bail!("known_nodes contains an empty node id");
            }
            if !seen.insert(node) {
                bail!("known_nodes contains duplicate id {node}");
            }
        }
        if self.queue_endpoint.is_empty() {
            bail!("queue_endpoint must be set");
        }
        if self.queue_name_prefix.is_empty() {
            bail!("queue_name_prefix must be non-empty");
        }
        if self.max_recovery_attempts == 0 {
            bail!("max_recovery_attempts must be at least 1");
        }
        if self.poll_max_batch == 0 {
            bail!("poll_max_batch must be at least 1");
        }
        Ok(())
    }

    /// Number of nodes in the federation.
    pub fn federation_size(&self) -> usize {
        self.known_nodes.len()
    }

    /// All peers other than this node.
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.known_nodes.iter().filter(move |n| **n != self.node_id)
    }

    /// Inbound queue name for `node` under the shared template.
    pub fn queue_name(&self, node: &NodeId) -> String {
        format!("{}-{}-queue", self.queue_name_prefix, node)
    }

    /// Derive the same configuration for a different member of the
    /// federation. Used by the in-process host and the test harness.
    pub fn for_node(&self, node_id: NodeId) -> Self {
        Self {
            node_id,
            ..self.clone()
        }
    }
}
