//! Configuration management commands.

use anyhow::{Context, Result};
use tracing::info;

use countermesh_core::FederationConfig;

use crate::args::{GenerateArgs, ValidateArgs};

/// Write the default configuration template for the operator to edit.
pub async fn generate(args: GenerateArgs) -> Result<()> {
    let config = FederationConfig::default();
    config.save(&args.output).await?;
    info!(path = %args.output, "default configuration written");
    println!("wrote {}", args.output);
    Ok(())
}

/// Load and validate a configuration file, printing a short summary.
pub async fn validate(args: ValidateArgs) -> Result<()> {
    let content = tokio::fs::read_to_string(&args.path)
        .await
        .with_context(|| format!("cannot read {}", args.path))?;
    let config: FederationConfig =
        serde_json::from_str(&content).with_context(|| format!("cannot parse {}", args.path))?;
    config.validate()?;

    println!("{} is valid", args.path);
    println!("  node:       {}", config.node_id);
    println!("  federation: {} nodes", config.federation_size());
    println!(
        "  queue:      {} @ {}",
        config.queue_name(&config.node_id),
        config.queue_endpoint
    );
    Ok(())
}
