//! Key and channel naming for the shared store.

/// Bus channel carrying newly registered server descriptors.
pub const CHANNEL_ONLINE: &str = "online";
/// Bus channel carrying descriptors of evicted or departed servers.
pub const CHANNEL_OFFLINE: &str = "offline";
/// Bus channel carrying the id of a session whose socket closed.
pub const CHANNEL_SESSION_CLOSE: &str = "session@close";

const PREFIX: &str = "trellis";

/// Global server descriptor hash, field per node id.
pub fn servers_key() -> String {
    format!("{PREFIX}:servers")
}

/// Per-type server descriptor hash.
pub fn type_servers_key(node_type: &str) -> String {
    format!("{PREFIX}:{node_type}:servers")
}

/// Canonical session record hash.
pub fn session_key(id: &str) -> String {
    format!("{PREFIX}:session:{id}")
}

/// Channel member set.
pub fn channel_key(name: &str) -> String {
    format!("{PREFIX}:channel:{name}")
}

/// Reverse index: channels a user currently belongs to.
pub fn user_channels_key(uid: &str) -> String {
    format!("{PREFIX}:channel:user:{uid}")
}
