//! Session continuity across physical reconnects.
//!
//! The server issues an opaque session id in its `connection` / `session`
//! frame. The id is offered back as a hint on every reconnect; if the server
//! answers with the same id the conversation is resumed, otherwise a new
//! session has started and the new id replaces the old one.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use leafline_proto::InboundFrame;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::LinkError;

/// Storage key for the chat channel's session id.
pub const CHAT_SESSION_KEY: &str = "chat_session_id";

/// A server-issued logical session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Opaque id assigned by the server.
    pub id: String,
    /// When the session was first attached in this process.
    pub established_at: DateTime<Utc>,
    /// Session-scoped parameters (e.g. the selected persona).
    pub params: Map<String, Value>,
}

/// Result of feeding a frame to the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The frame does not establish a session.
    NotSession,
    /// The server started a fresh session.
    New {
        /// Id of the new session.
        session_id: String,
        /// Id we offered, if any.
        previous: Option<String>,
    },
    /// The server reattached the session we offered.
    Resumed {
        /// Id of the resumed session.
        session_id: String,
    },
    /// A session frame without a usable id.
    Malformed {
        /// What was wrong with it.
        reason: String,
    },
}

/// Where session ids outlive a channel.
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Read the id stored under `key`.
    fn load(&self, key: &str) -> Result<Option<String>, LinkError>;

    /// Store `session_id` under `key`.
    fn save(&self, key: &str, session_id: &str) -> Result<(), LinkError>;

    /// Forget `key`.
    fn remove(&self, key: &str) -> Result<(), LinkError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, key: &str) -> Result<Option<String>, LinkError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, key: &str, session_id: &str) -> Result<(), LinkError> {
        self.entries
            .lock()
            .insert(key.to_string(), session_id.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LinkError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// JSON file holding a flat `key -> session id` map.
///
/// Writes go to a sibling temp file that is then renamed over the original.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    /// Store backed by `path`. The file is created on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>, LinkError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                LinkError::Persistence(format!("corrupt {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), LinkError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(map)
            .map_err(|e| LinkError::Persistence(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, key: &str) -> Result<Option<String>, LinkError> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.remove(key))
    }

    fn save(&self, key: &str, session_id: &str) -> Result<(), LinkError> {
        let _guard = self.lock.lock();
        // Corrupt contents are overwritten.
        let mut map = self.read_map().unwrap_or_default();
        map.insert(key.to_string(), session_id.to_string());
        self.write_map(&map)
    }

    fn remove(&self, key: &str) -> Result<(), LinkError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map().unwrap_or_default();
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// Owns one channel's session id and decides new vs. resumed.
#[derive(Debug)]
pub(crate) struct SessionManager {
    key: String,
    store: Arc<dyn SessionStore>,
    known_id: Option<String>,
    established_at: Option<DateTime<Utc>>,
    params: Map<String, Value>,
}

impl SessionManager {
    /// Load any persisted id for `key` as the initial hint.
    pub(crate) fn new(key: impl Into<String>, store: Arc<dyn SessionStore>) -> Self {
        let key = key.into();
        let known_id = match store.load(&key) {
            Ok(id) => id,
            Err(e) => {
                warn!(key = %key, error = %e, "could not load persisted session id");
                None
            }
        };
        if let Some(id) = &known_id {
            debug!(key = %key, session_id = %id, "loaded persisted session id");
        }

        Self {
            key,
            store,
            known_id,
            established_at: None,
            params: Map::new(),
        }
    }

    /// Classify `frame` and update the session accordingly.
    pub(crate) fn observe(&mut self, frame: &InboundFrame) -> SessionOutcome {
        let InboundFrame::Session(session_frame) = frame else {
            return SessionOutcome::NotSession;
        };

        let Some(session_id) = session_frame.session_id() else {
            return SessionOutcome::Malformed {
                reason: format!("{} frame without session_id", session_frame.kind.as_str()),
            };
        };

        if self.known_id.as_deref() == Some(session_id) {
            self.established_at.get_or_insert_with(Utc::now);
            debug!(session_id = %session_id, "session resumed");
            return SessionOutcome::Resumed {
                session_id: session_id.to_string(),
            };
        }

        let previous = self.known_id.replace(session_id.to_string());
        self.established_at = Some(Utc::now());
        if let Err(e) = self.store.save(&self.key, session_id) {
            warn!(key = %self.key, error = %e, "could not persist session id");
        }
        info!(session_id = %session_id, previous = ?previous, "new session");

        SessionOutcome::New {
            session_id: session_id.to_string(),
            previous,
        }
    }

    /// Forget the session, locally and in the store.
    pub(crate) fn clear(&mut self) {
        self.known_id = None;
        self.established_at = None;
        if let Err(e) = self.store.remove(&self.key) {
            warn!(key = %self.key, error = %e, "could not remove persisted session id");
        }
    }

    /// Id to offer as the connection hint.
    pub(crate) fn hint(&self) -> Option<&str> {
        self.known_id.as_deref()
    }

    pub(crate) fn set_params(&mut self, params: Map<String, Value>) {
        self.params = params;
    }

    pub(crate) fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// The attached session, if one has been established in this process.
    pub(crate) fn current(&self) -> Option<Session> {
        match (&self.known_id, self.established_at) {
            (Some(id), Some(established_at)) => Some(Session {
                id: id.clone(),
                established_at,
                params: self.params.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(text: &str) -> InboundFrame {
        InboundFrame::parse(text).expect("valid frame")
    }

    fn manager() -> SessionManager {
        SessionManager::new(CHAT_SESSION_KEY, Arc::new(MemorySessionStore::new()))
    }

    #[test]
    fn test_first_session_is_new() {
        let mut sessions = manager();
        assert!(sessions.hint().is_none());

        let outcome = sessions.observe(&frame(r#"{"type":"connection","session_id":"abc"}"#));
        assert_eq!(
            outcome,
            SessionOutcome::New {
                session_id: "abc".to_string(),
                previous: None
            }
        );
        assert_eq!(sessions.hint(), Some("abc"));
        assert_eq!(sessions.current().map(|s| s.id), Some("abc".to_string()));
    }

    #[test]
    fn test_same_id_resumes() {
        let mut sessions = manager();
        sessions.observe(&frame(r#"{"type":"connection","session_id":"abc"}"#));
        let first_established = sessions.current().expect("session").established_at;

        let outcome = sessions.observe(&frame(r#"{"type":"session","session_id":"abc"}"#));
        assert_eq!(
            outcome,
            SessionOutcome::Resumed {
                session_id: "abc".to_string()
            }
        );
        assert_eq!(
            sessions.current().expect("session").established_at,
            first_established
        );
    }

    #[test]
    fn test_different_id_replaces_and_persists() {
        let store = Arc::new(MemorySessionStore::new());
        let mut sessions = SessionManager::new(CHAT_SESSION_KEY, store.clone());
        sessions.observe(&frame(r#"{"type":"connection","session_id":"abc"}"#));

        let outcome = sessions.observe(&frame(r#"{"type":"session","session_id":"def"}"#));
        assert_eq!(
            outcome,
            SessionOutcome::New {
                session_id: "def".to_string(),
                previous: Some("abc".to_string())
            }
        );
        assert_eq!(
            store.load(CHAT_SESSION_KEY).expect("load"),
            Some("def".to_string())
        );
    }

    #[test]
    fn test_non_session_and_malformed_frames() {
        let mut sessions = manager();
        assert_eq!(
            sessions.observe(&frame(r#"{"type":"message","content":"hi"}"#)),
            SessionOutcome::NotSession
        );
        assert_eq!(sessions.observe(&InboundFrame::Ping), SessionOutcome::NotSession);
        assert!(matches!(
            sessions.observe(&frame(r#"{"type":"session"}"#)),
            SessionOutcome::Malformed { .. }
        ));
        assert!(sessions.hint().is_none());
    }

    #[test]
    fn test_persisted_id_becomes_hint_and_resumes() {
        let store = Arc::new(MemorySessionStore::new());
        store.save(CHAT_SESSION_KEY, "abc").expect("save");

        let mut sessions = SessionManager::new(CHAT_SESSION_KEY, store);
        assert_eq!(sessions.hint(), Some("abc"));
        assert!(sessions.current().is_none());

        let outcome = sessions.observe(&frame(r#"{"type":"connection","session_id":"abc"}"#));
        assert!(matches!(outcome, SessionOutcome::Resumed { .. }));
        assert!(sessions.current().is_some());
    }

    #[test]
    fn test_clear_forgets_everywhere() {
        let store = Arc::new(MemorySessionStore::new());
        let mut sessions = SessionManager::new(CHAT_SESSION_KEY, store.clone());
        sessions.observe(&frame(r#"{"type":"connection","session_id":"abc"}"#));

        sessions.clear();
        assert!(sessions.hint().is_none());
        assert!(sessions.current().is_none());
        assert_eq!(store.load(CHAT_SESSION_KEY).expect("load"), None);
    }

    #[test]
    fn test_params_travel_with_session() {
        let mut sessions = manager();
        let mut params = Map::new();
        params.insert("persona".to_string(), json!("budtender"));
        sessions.set_params(params.clone());
        sessions.observe(&frame(r#"{"type":"connection","session_id":"abc"}"#));

        assert_eq!(sessions.params(), &params);
        assert_eq!(sessions.current().expect("session").params, params);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("sessions.json");
        let store = FileSessionStore::new(&path);

        assert_eq!(store.load(CHAT_SESSION_KEY).expect("empty load"), None);
        store.save(CHAT_SESSION_KEY, "abc").expect("save");
        store.save("delivery_d-1_session_id", "xyz").expect("save");

        let reopened = FileSessionStore::new(&path);
        assert_eq!(
            reopened.load(CHAT_SESSION_KEY).expect("load"),
            Some("abc".to_string())
        );

        let on_disk: HashMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(on_disk.get("chat_session_id"), Some(&"abc".to_string()));

        reopened.remove(CHAT_SESSION_KEY).expect("remove");
        assert_eq!(store.load(CHAT_SESSION_KEY).expect("load"), None);
        assert_eq!(
            store.load("delivery_d-1_session_id").expect("load"),
            Some("xyz".to_string())
        );
    }

    #[test]
    fn test_file_store_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{not json").expect("write");

        let store = FileSessionStore::new(&path);
        assert!(matches!(
            store.load(CHAT_SESSION_KEY),
            Err(LinkError::Persistence(_))
        ));

        // Saving replaces the corrupt contents.
        store.save(CHAT_SESSION_KEY, "abc").expect("save");
        assert_eq!(
            store.load(CHAT_SESSION_KEY).expect("load"),
            Some("abc".to_string())
        );
    }

    #[test]
    fn test_manager_survives_unreadable_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "garbage").expect("write");

        let sessions = SessionManager::new(CHAT_SESSION_KEY, Arc::new(FileSessionStore::new(path)));
        assert!(sessions.hint().is_none());
    }
}
