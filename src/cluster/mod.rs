//! Cluster membership and coordination.
//!
//! - `registry` - live server descriptors and membership events
//! - `routing` - routing hash and pluggable target selection
//! - `health` - periodic liveness polling and eviction

pub mod health;
pub mod registry;
pub mod routing;

pub use health::*;
pub use registry::*;
pub use routing::*;
