mod bootstrap_helpers;
mod cli_args;

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    bootstrap_helpers::{init_tracing, redacted_config},
    cli_args::Cli,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.gateway_config()?;
    if cli.check_config {
        let rendered = serde_json::to_string_pretty(&redacted_config(&config))
            .context("failed to render gateway config")?;
        println!("{rendered}");
        return Ok(());
    }
    init_tracing(&config.log_level);
    onegate_gateway::run_gateway(config).await
}
