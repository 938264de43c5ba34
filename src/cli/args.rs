//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Trellis - distributed session and message routing fabric.
#[derive(Parser)]
#[command(name = "trellis")]
#[command(version)]
#[command(about = "Trellis cluster node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a Trellis node
    Start(StartArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/trellis.toml")]
    pub config: PathBuf,
}
