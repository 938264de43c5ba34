//! The session record.
//!
//! A session is a flat string map persisted as a store hash. Three fields
//! are structural and get accessors; the rest carry application state.

use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Field holding the session id.
pub const FIELD_ID: &str = "id";
/// Field holding the bound user id.
pub const FIELD_UID: &str = "uid";
/// Field naming the gateway node that owns the connection.
pub const FIELD_FRONTEND: &str = "frontendId";
/// Field holding the JSON-encoded handshake headers.
pub const FIELD_HEADERS: &str = "headers";

/// A session's settings map. Cheap to clone; snapshots taken off the live
/// table are independent of later mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    settings: HashMap<String, String>,
}

impl Session {
    /// A fresh session with a random id.
    pub fn anonymous() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let mut settings = HashMap::new();
        settings.insert(FIELD_ID.to_string(), id.into());
        Self { settings }
    }

    /// Rebuild a session from a persisted settings map. Returns `None` when
    /// the record lacks an id, which only happens for corrupt writes.
    pub fn from_settings(settings: HashMap<String, String>) -> Option<Self> {
        if !settings.contains_key(FIELD_ID) {
            return None;
        }
        Some(Self { settings })
    }

    pub fn id(&self) -> &str {
        self.settings
            .get(FIELD_ID)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Bound user id, if any. Empty values count as unbound.
    pub fn uid(&self) -> Option<&str> {
        self.settings
            .get(FIELD_UID)
            .map(String::as_str)
            .filter(|u| !u.is_empty())
    }

    /// Gateway node owning the connection, if any.
    pub fn frontend(&self) -> Option<&str> {
        self.settings
            .get(FIELD_FRONTEND)
            .map(String::as_str)
            .filter(|f| !f.is_empty())
    }

    /// Handshake headers as a JSON document. Missing or unparseable headers
    /// read as an empty object.
    pub fn headers(&self) -> Value {
        self.settings
            .get(FIELD_HEADERS)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.settings.insert(key.into(), value.into());
    }

    /// Associate a user identity with this session.
    pub fn bind(&mut self, uid: impl Into<String>) {
        self.set(FIELD_UID, uid);
    }

    pub fn set_frontend(&mut self, node_id: impl Into<String>) {
        self.set(FIELD_FRONTEND, node_id);
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    /// Settings as owned pairs, the shape `map_put_all` takes.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.settings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// A subset of settings, keeping only fields that exist.
    pub fn entries_for(&self, keys: &[String]) -> Vec<(String, String)> {
        keys.iter()
            .filter_map(|k| self.settings.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_sessions_get_distinct_ids() {
        let a = Session::anonymous();
        let b = Session::anonymous();
        assert!(!a.id().is_empty());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn empty_uid_counts_as_unbound() {
        let mut session = Session::with_id("s");
        assert_eq!(session.uid(), None);
        session.set(FIELD_UID, "");
        assert_eq!(session.uid(), None);
        session.bind("u-1");
        assert_eq!(session.uid(), Some("u-1"));
    }

    #[test]
    fn headers_tolerate_garbage() {
        let mut session = Session::with_id("s");
        session.set(FIELD_HEADERS, "not json");
        assert_eq!(session.headers(), serde_json::json!({}));
        session.set(FIELD_HEADERS, "{\"ua\":\"test\"}");
        assert_eq!(session.headers()["ua"], "test");
    }

    #[test]
    fn from_settings_requires_an_id() {
        let mut settings = HashMap::new();
        settings.insert("uid".to_string(), "u".to_string());
        assert!(Session::from_settings(settings.clone()).is_none());
        settings.insert("id".to_string(), "s".to_string());
        let session = Session::from_settings(settings).unwrap();
        assert_eq!(session.id(), "s");
    }
}
