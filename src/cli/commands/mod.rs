//! CLI command implementations.

mod start;

pub use start::run_start;
