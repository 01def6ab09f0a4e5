//! # countermesh harness CLI
//!
//! Operator tooling for the replicated-counter federation:
//!
//! - `simulate` boots a complete in-process federation over the in-memory
//!   broker, drives concurrent increment load against randomly chosen nodes
//!   (with busy-retry, matching how the external trigger behaves), and
//!   prints a consistency report as JSON.
//! - `config generate` / `config validate` write and check the JSON
//!   federation configuration.
//!
//! ```bash
//! # 25 increments through a 5-node federation
//! countermesh-cli simulate
//!
//! # heavier load with one unreachable peer
//! countermesh-cli simulate --increments 200 --concurrency 8 --block-node n5
//!
//! # configuration management
//! countermesh-cli config generate --output countermesh.json
//! countermesh-cli config validate countermesh.json
//! ```

mod args;
mod config_cmd;
mod simulate;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::args::{GenerateArgs, SimulateArgs, ValidateArgs};

#[derive(Debug, Parser)]
#[command(name = "countermesh-cli", about = "countermesh federation harness")]
struct Cli {
    /// Enable debug-level logging.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an in-process federation under increment load.
    Simulate(SimulateArgs),

    /// Configuration management.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Write the default configuration file.
    Generate(GenerateArgs),
    /// Validate an existing configuration file.
    Validate(ValidateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("countermesh={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Simulate(args) => {
            let report = simulate::run(args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.converged {
                std::process::exit(1);
            }
        }
        Command::Config(ConfigCommand::Generate(args)) => config_cmd::generate(args).await?,
        Command::Config(ConfigCommand::Validate(args)) => config_cmd::validate(args).await?,
    }
    Ok(())
}
