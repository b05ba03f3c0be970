//! Session store
//!
//! Per-session ordered message history plus the transient buffer that
//! collects streamed chunks for the turn currently being generated.
//!
//! The buffer has a single owner: the correlation id passed to
//! [`SessionStore::begin_turn`]. Chunks, finalization and abandonment from
//! any other correlation id are refused, so a cancelled or superseded turn
//! can never write into a newer one.

use crate::error::{FlowError, Result};
use crate::config::SessionConfig;
use crate::persist::{FileSessionPersistence, SessionPersistence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Default number of appended messages between autosaves
pub const DEFAULT_AUTOSAVE_EVERY: usize = 5;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,

    /// Reasoning split out of the model output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,

    /// Short form used when this turn is replayed as prompt context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thought: None,
            summary: None,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Text to replay as context: the summary if present, else the content
    pub fn context_text(&self) -> &str {
        self.summary.as_deref().unwrap_or(&self.content)
    }
}

/// Conversation state for one session id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,

    #[serde(skip)]
    buffer: Vec<String>,
    #[serde(skip)]
    turn_owner: Option<String>,
    #[serde(skip)]
    unsaved: usize,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            created_at: now,
            last_accessed: now,
            buffer: Vec::new(),
            turn_owner: None,
            unsaved: 0,
        }
    }

    /// Correlation id that currently owns the response buffer
    pub fn turn_owner(&self) -> Option<&str> {
        self.turn_owner.as_deref()
    }

    fn owns(&self, correlation_id: &str) -> bool {
        self.turn_owner.as_deref() == Some(correlation_id)
    }

    fn release_turn(&mut self) {
        self.buffer.clear();
        self.turn_owner = None;
    }

    fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }
}

type SessionHandle = Arc<Mutex<Session>>;

/// Concurrent map of sessions, one lock per session
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    autosave_every: usize,
}

impl SessionStore {
    /// In-memory store without persistence
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence: None,
            autosave_every: DEFAULT_AUTOSAVE_EVERY,
        }
    }

    /// Store that loads sessions from and autosaves them to `persistence`
    pub fn with_persistence(
        persistence: Arc<dyn SessionPersistence>,
        autosave_every: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence: Some(persistence),
            autosave_every: autosave_every.max(1),
        }
    }

    /// File-backed store when `storage_path` is set, in-memory otherwise
    pub fn from_config(config: &SessionConfig) -> Self {
        match &config.storage_path {
            Some(dir) => Self::with_persistence(
                Arc::new(FileSessionPersistence::new(dir.clone())),
                config.autosave_every,
            ),
            None => Self::new(),
        }
    }

    /// Fetch a session, loading or creating it on first reference
    pub fn get_or_create(&self, session_id: &str) -> Result<SessionHandle> {
        {
            let sessions = self
                .sessions
                .read()
                .map_err(|e| FlowError::Lock(format!("session map: {}", e)))?;
            if let Some(handle) = sessions.get(session_id) {
                return Ok(Arc::clone(handle));
            }
        }

        let loaded = match &self.persistence {
            Some(p) => p.load(session_id).unwrap_or_else(|e| {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to load session, starting fresh");
                None
            }),
            None => None,
        };

        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| FlowError::Lock(format!("session map: {}", e)))?;
        let handle = sessions.entry(session_id.to_string()).or_insert_with(|| {
            let session = loaded.unwrap_or_else(|| {
                tracing::debug!(session_id = %session_id, "Session created");
                Session::new(session_id)
            });
            Arc::new(Mutex::new(session))
        });
        Ok(Arc::clone(handle))
    }

    /// Whether a session is resident in memory
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .map(|s| s.contains_key(session_id))
            .unwrap_or(false)
    }

    /// Number of resident sessions
    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Result<T> {
        let handle = self.get_or_create(session_id)?;
        let mut session = lock(&handle)?;
        session.touch();
        Ok(f(&mut session))
    }

    /// Append a message, returning the new history length
    pub fn add_message(&self, session_id: &str, message: Message) -> Result<usize> {
        let (len, snapshot) = self.with_session(session_id, |session| {
            session.messages.push(message);
            let snapshot = self.autosave_snapshot(session);
            (session.messages.len(), snapshot)
        })?;
        self.persist(snapshot);
        Ok(len)
    }

    /// Claim the response buffer for a new turn
    ///
    /// Any buffered text from a previous owner is discarded; that owner's
    /// later chunks will be refused.
    pub fn begin_turn(&self, session_id: &str, correlation_id: &str) -> Result<()> {
        self.with_session(session_id, |session| {
            if let Some(previous) = session.turn_owner.as_deref() {
                tracing::debug!(
                    session_id = %session_id,
                    previous = %previous,
                    correlation_id = %correlation_id,
                    "Turn superseded"
                );
            }
            session.buffer.clear();
            session.turn_owner = Some(correlation_id.to_string());
        })
    }

    /// Append a streamed chunk; returns false if `correlation_id` does not
    /// own the buffer
    pub fn append_chunk(&self, session_id: &str, correlation_id: &str, chunk: &str) -> Result<bool> {
        self.with_session(session_id, |session| {
            if !session.owns(correlation_id) {
                tracing::debug!(
                    session_id = %session_id,
                    correlation_id = %correlation_id,
                    "Chunk refused, not the turn owner"
                );
                return false;
            }
            session.buffer.push(chunk.to_string());
            true
        })
    }

    /// Concatenated contents of the response buffer
    pub fn response_buffer(&self, session_id: &str) -> Result<String> {
        self.with_session(session_id, |session| session.buffer.concat())
    }

    /// Join the buffer, append the message built from it, and release the
    /// buffer, all under the session lock
    ///
    /// Returns `None` without touching history when `correlation_id` is not
    /// the turn owner.
    pub fn finalize_turn<F>(
        &self,
        session_id: &str,
        correlation_id: &str,
        build: F,
    ) -> Result<Option<Message>>
    where
        F: FnOnce(String) -> Message,
    {
        let outcome = self.with_session(session_id, |session| {
            if !session.owns(correlation_id) {
                return None;
            }
            let text = session.buffer.concat();
            let message = build(text);
            session.messages.push(message.clone());
            session.release_turn();
            Some((message, self.autosave_snapshot(session)))
        })?;

        Ok(outcome.map(|(message, snapshot)| {
            self.persist(snapshot);
            message
        }))
    }

    /// Drop the buffer without touching history; false if not the owner
    pub fn abandon_turn(&self, session_id: &str, correlation_id: &str) -> Result<bool> {
        self.with_session(session_id, |session| {
            if !session.owns(correlation_id) {
                return false;
            }
            session.release_turn();
            true
        })
    }

    /// Erase history and buffer, and delete the persisted copy
    pub fn clear_history(&self, session_id: &str) -> Result<()> {
        self.with_session(session_id, |session| {
            session.messages.clear();
            session.release_turn();
            session.unsaved = 0;
        })?;

        if let Some(p) = &self.persistence {
            if let Err(e) = p.delete(session_id) {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to delete session file");
            }
        }
        tracing::info!(session_id = %session_id, "History cleared");
        Ok(())
    }

    /// The last `max` messages in append order
    pub fn history(&self, session_id: &str, max: usize) -> Result<Vec<Message>> {
        self.with_session(session_id, |session| {
            let start = session.messages.len().saturating_sub(max);
            session.messages[start..].to_vec()
        })
    }

    /// Write a session out now, regardless of the autosave counter
    pub fn save(&self, session_id: &str) -> Result<()> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let snapshot = self.with_session(session_id, |session| {
            session.unsaved = 0;
            session.clone()
        })?;
        p.save(&snapshot)
    }

    fn autosave_snapshot(&self, session: &mut Session) -> Option<Session> {
        self.persistence.as_ref()?;
        session.unsaved += 1;
        if session.unsaved < self.autosave_every {
            return None;
        }
        session.unsaved = 0;
        Some(session.clone())
    }

    fn persist(&self, snapshot: Option<Session>) {
        let (Some(p), Some(session)) = (&self.persistence, snapshot) else {
            return;
        };
        if let Err(e) = p.save(&session) {
            tracing::warn!(session_id = %session.id, error = %e, "Autosave failed");
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(handle: &SessionHandle) -> Result<MutexGuard<'_, Session>> {
    handle
        .lock()
        .map_err(|e| FlowError::Lock(format!("session: {}", e)))
}
