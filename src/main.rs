//! Trellis - unified CLI entrypoint.
//!
//! Usage:
//!   trellis start --config config/trellis.toml

use anyhow::Result;
use clap::Parser;
use trellis::cli::commands::run_start;
use trellis::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
    }
}
