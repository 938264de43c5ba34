//! Start command - launches a Trellis node.

use crate::cli::args::StartArgs;
use crate::core::config::Config;
use crate::core::runtime::NodeRuntime;
use crate::dispatch::HandlerRegistry;
use crate::store::open_store;
use crate::telemetry;
use anyhow::{Context, Result};

pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    let log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    let store = open_store(&config.store)
        .await
        .context("failed to open shared store")?;
    // The bare binary registers no handlers; embedders construct the
    // runtime themselves with their services in place.
    let handlers = HandlerRegistry::new();
    let mut runtime = NodeRuntime::new(config, store, handlers, Some(log_handle))?;
    runtime.run().await
}
