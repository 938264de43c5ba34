//! Trellis CLI - command-line interface.
//!
//! Provides the binary entry point:
//! - `trellis start` - Start a node

mod args;
pub mod commands;

pub use args::{Cli, Commands, StartArgs};
