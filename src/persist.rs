//! Session persistence
//!
//! Pluggable storage for conversation history so sessions survive process
//! restarts. The `SessionStore` saves through a `SessionPersistence` every
//! few messages and deletes the stored copy when history is cleared.

use crate::error::{FlowError, Result};
use crate::session::Session;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Trait for persisting session history
pub trait SessionPersistence: Send + Sync {
    /// Save one session, replacing any stored copy
    fn save(&self, session: &Session) -> Result<()>;

    /// Load a session by id; `None` if it was never saved
    fn load(&self, session_id: &str) -> Result<Option<Session>>;

    /// Delete the stored copy; deleting a missing session is not an error
    fn delete(&self, session_id: &str) -> Result<()>;
}

/// JSON file per session under a storage directory
///
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileSessionPersistence {
    dir: PathBuf,
}

impl FileSessionPersistence {
    /// Create a persistence rooted at `dir`; the directory is created lazily
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds a given session
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(session_id)))
    }
}

/// Percent-encoded session id: never leaves the directory, and distinct
/// ids never share a file
fn file_stem(session_id: &str) -> String {
    urlencoding::encode(session_id).into_owned()
}

impl SessionPersistence for FileSessionPersistence {
    fn save(&self, session: &Session) -> Result<()> {
        let json = serde_json::to_string_pretty(session)?;
        let path = self.path_for(&session.id);
        let tmp_path = path.with_extension("json.tmp");

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            FlowError::Persistence(format!(
                "Failed to create session directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        std::fs::write(&tmp_path, json).map_err(|e| {
            FlowError::Persistence(format!(
                "Failed to write session file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &path).map_err(|e| {
            FlowError::Persistence(format!(
                "Failed to rename session file {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::debug!(
            session_id = %session.id,
            path = %path.display(),
            messages = session.messages.len(),
            "Session saved"
        );
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path).map_err(|e| {
            FlowError::Persistence(format!(
                "Failed to read session file {}: {}",
                path.display(),
                e
            ))
        })?;

        let session: Session = serde_json::from_str(&json).map_err(|e| {
            FlowError::Persistence(format!(
                "Failed to parse session file {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::debug!(
            session_id = %session_id,
            messages = session.messages.len(),
            "Session loaded"
        );
        Ok(Some(session))
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, "Session file deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FlowError::Persistence(format!(
                "Failed to delete session file {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// In-memory persistence for tests and single-process use
#[derive(Default)]
pub struct MemorySessionPersistence {
    sessions: std::sync::RwLock<HashMap<String, Session>>,
}

impl MemorySessionPersistence {
    /// Number of stored sessions
    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionPersistence for MemorySessionPersistence {
    fn save(&self, session: &Session) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| FlowError::Lock(format!("session persistence: {}", e)))?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| FlowError::Lock(format!("session persistence: {}", e)))?;
        Ok(sessions.get(session_id).cloned())
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| FlowError::Lock(format!("session persistence: {}", e)))?;
        sessions.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Message, Role};

    fn sample_session(id: &str) -> Session {
        let mut session = Session::new(id);
        session.messages.push(Message::new(Role::User, "what is rust?"));
        session
            .messages
            .push(Message::new(Role::Assistant, "A systems language.").with_summary("A systems language."));
        session
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionPersistence::new(dir.path());

        store.save(&sample_session("s1")).unwrap();
        let loaded = store.load("s1").unwrap().unwrap();

        assert_eq!(loaded.id, "s1");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].role, Role::Assistant);
        assert_eq!(loaded.messages[1].summary.as_deref(), Some("A systems language."));
    }

    #[test]
    fn test_file_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionPersistence::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_file_creates_directory_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = FileSessionPersistence::new(&nested);

        store.save(&sample_session("s1")).unwrap();

        assert!(store.path_for("s1").exists());
        assert!(!store.path_for("s1").with_extension("json.tmp").exists());
    }

    #[test]
    fn test_file_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionPersistence::new(dir.path());

        tokio_test::assert_ok!(store.save(&sample_session("s1")));
        tokio_test::assert_ok!(store.delete("s1"));
        assert!(!store.path_for("s1").exists());

        // Deleting twice is fine
        tokio_test::assert_ok!(store.delete("s1"));
    }

    #[test]
    fn test_file_corrupt_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionPersistence::new(dir.path());
        std::fs::write(store.path_for("bad"), "not json").unwrap();

        let err = tokio_test::assert_err!(store.load("bad"));
        assert!(matches!(err, FlowError::Persistence(_)));
    }

    #[test]
    fn test_session_id_cannot_escape_directory() {
        let store = FileSessionPersistence::new("/tmp/sessions");
        let path = store.path_for("../../etc/passwd");
        assert_eq!(path.parent(), Some(Path::new("/tmp/sessions")));
    }

    #[test]
    fn test_similar_session_ids_use_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionPersistence::new(dir.path());
        let ids = ["a/b", "a.b", "a_b", "a b", "a%2Fb"];

        let paths: std::collections::HashSet<PathBuf> =
            ids.iter().map(|id| store.path_for(id)).collect();
        assert_eq!(paths.len(), ids.len());

        store.save(&sample_session("a/b")).unwrap();
        assert!(store.load("a_b").unwrap().is_none());
        assert!(store.load("a.b").unwrap().is_none());
        assert_eq!(store.load("a/b").unwrap().unwrap().id, "a/b");
    }

    #[test]
    fn test_memory_persistence() {
        let store = MemorySessionPersistence::default();
        assert!(store.is_empty());

        store.save(&sample_session("s1")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("s1").unwrap().unwrap().messages.len(), 2);

        store.delete("s1").unwrap();
        assert!(store.load("s1").unwrap().is_none());
    }
}
