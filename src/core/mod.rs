//! Core runtime infrastructure.
//!
//! This module contains the essential components for running a Trellis node:
//! - `config` - Configuration parsing and validation
//! - `runtime` - Node runtime orchestration
//! - `time` - Deterministic time utilities

pub mod config;
pub mod runtime;
pub mod time;

pub use config::*;
pub use runtime::*;
pub use time::*;
