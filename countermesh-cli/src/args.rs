//! Command-line argument structures for the countermesh harness.

use clap::Args;

/// Arguments for the in-process federation load simulation.
///
/// The simulation boots a complete federation over the in-memory broker,
/// drives concurrent increment requests against randomly chosen nodes, and
/// prints a consistency report. Busy responses are retried, mirroring how
/// an external trigger is expected to behave.
#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Number of federation nodes (minimum 3).
    #[arg(long, default_value_t = 5)]
    pub nodes: usize,

    /// Total increments to drive through the federation.
    #[arg(long, default_value_t = 25)]
    pub increments: u64,

    /// Concurrent trigger workers issuing increments.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Block this node's inbound queue for the whole run, simulating an
    /// unreachable peer (e.g. "n5").
    #[arg(long)]
    pub block_node: Option<String>,

    /// Per-request retry budget when a node answers busy.
    #[arg(long, default_value_t = 20)]
    pub retries: u32,

    /// How long to wait for the federation to converge after the load
    /// finishes, in seconds.
    #[arg(long, default_value_t = 10)]
    pub settle_secs: u64,
}

/// Arguments for writing a default configuration file.
#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Destination path for the generated configuration.
    #[arg(long, default_value = "countermesh.json")]
    pub output: String,
}

/// Arguments for validating an existing configuration file.
#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Path of the configuration file to check.
    pub path: String,
}
