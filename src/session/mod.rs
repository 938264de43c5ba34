//! Session model and cross-node session directory.
//!
//! - `session` - the plain settings-map record persisted in the store
//! - `table` - locally held live connections on a gateway node
//! - `directory` - cluster-wide lookup, persistence and remote control
//! - `channel` - named broadcast groups over the directory

pub mod channel;
pub mod directory;
pub mod session;
pub mod table;

pub use channel::{ChannelDirectory, ChannelMember};
pub use directory::SessionDirectory;
pub use session::Session;
pub use table::{ClientSink, LiveSession, SessionTable, SocketState};
