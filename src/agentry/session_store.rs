//! Durable per-conversation storage.
//!
//! The session store persists four keyspaces per conversation (the session
//! record, its ordered message list, a typed context scratchpad, and workflow
//! records) behind the [`SessionBackend`] trait.  The primary backend is a
//! SQLite database ([`SqliteBackend`]); when it cannot be opened at startup
//! the store transparently falls back to an in-process map
//! ([`MemoryBackend`]) that loses data on restart and logs a warning.  The
//! interface is identical either way.
//!
//! Sessions expire on a TTL that is refreshed on every access.  Readers must
//! tolerate a session disappearing between calls.
//!
//! ```rust,no_run
//! use agentry::session_store::SessionStore;
//! use std::path::Path;
//!
//! # async {
//! let store = SessionStore::open(Path::new("sessions.db"), chrono::Duration::hours(24), 100);
//! let sid = store.create_session(Some("demo")).await?;
//! store.append_message(&sid, "user", "Hello!", serde_json::json!({})).await?;
//! let context = store.recent_context(&sid, 20).await?;
//! assert_eq!(context.len(), 1);
//! # Ok::<(), agentry::session_store::StorageError>(())
//! # };
//! ```

use crate::agentry::llm_client::{ChatMessage, ChatRole};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

/// Bounded retry count for message appends before the store gives up.
const APPEND_RETRIES: u32 = 3;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "closed" => SessionStatus::Closed,
            _ => SessionStatus::Active,
        }
    }
}

/// Metadata record for one conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Always equals the current length of the (capped) message list.
    pub message_count: usize,
    /// Workflow currently bound to this session, if any.
    pub active_workflow: Option<String>,
    pub status: SessionStatus,
}

/// One immutable entry in a session's message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Errors surfaced by the session store.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// The backend stayed unreachable through the bounded retry loop.  The
    /// caller must treat the message as unrecorded (it may re-send).
    Unavailable(String),
    /// A single backend operation failed.
    Backend(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable(msg) => write!(f, "storage unavailable: {}", msg),
            StorageError::Backend(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Storage interface shared by the durable and in-memory implementations.
///
/// `append_message` is atomic: it inserts the message, bumps
/// `message_count`/`updated_at`, and evicts the oldest entries past the cap
/// in one step.  Appends within a single session are serialized; no ordering
/// is promised across sessions.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn create_session(&self, session: Session) -> Result<(), StorageError>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StorageError>;
    async fn update_session(
        &self,
        id: &str,
        active_workflow: Option<Option<String>>,
        status: Option<SessionStatus>,
    ) -> Result<(), StorageError>;
    async fn append_message(&self, id: &str, message: StoredMessage) -> Result<(), StorageError>;
    async fn messages(&self, id: &str, limit: Option<usize>) -> Result<Vec<StoredMessage>, StorageError>;
    async fn set_context(&self, id: &str, key: &str, value: serde_json::Value) -> Result<(), StorageError>;
    async fn get_context(&self, id: &str, key: &str) -> Result<Option<serde_json::Value>, StorageError>;
    async fn context_map(&self, id: &str) -> Result<HashMap<String, serde_json::Value>, StorageError>;
    async fn save_workflow(&self, id: &str, workflow_id: &str, data: serde_json::Value) -> Result<(), StorageError>;
    async fn get_workflow(&self, id: &str, workflow_id: &str) -> Result<Option<serde_json::Value>, StorageError>;
    async fn delete_session(&self, id: &str) -> Result<(), StorageError>;
}

// ── SQLite backend ───────────────────────────────────────────────────────

/// Durable [`SessionBackend`] over a SQLite database file.
///
/// All calls go through `tokio::task::spawn_blocking` so the single
/// connection never blocks the async scheduler.
pub struct SqliteBackend {
    conn: Arc<StdMutex<Connection>>,
    ttl: Duration,
    max_messages: usize,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path` and run the schema.
    pub fn open(path: &Path, ttl: Duration, max_messages: usize) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                 id              TEXT PRIMARY KEY,
                 created_at      TEXT NOT NULL,
                 updated_at      TEXT NOT NULL,
                 message_count   INTEGER NOT NULL DEFAULT 0,
                 active_workflow TEXT,
                 status          TEXT NOT NULL DEFAULT 'active',
                 expires_at      INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS messages (
                 seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL,
                 id         TEXT NOT NULL,
                 role       TEXT NOT NULL,
                 content    TEXT NOT NULL,
                 timestamp  TEXT NOT NULL,
                 metadata   TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq);
             CREATE TABLE IF NOT EXISTS context (
                 session_id TEXT NOT NULL,
                 key        TEXT NOT NULL,
                 value      TEXT NOT NULL,
                 PRIMARY KEY (session_id, key)
             );
             CREATE TABLE IF NOT EXISTS workflows (
                 session_id  TEXT NOT NULL,
                 workflow_id TEXT NOT NULL,
                 data        TEXT NOT NULL,
                 PRIMARY KEY (session_id, workflow_id)
             );",
        )?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
            ttl,
            max_messages,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::Backend("connection mutex poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {}", e)))?
    }

    fn expires_at(&self) -> i64 {
        (Utc::now() + self.ttl).timestamp()
    }
}

/// Drop every session (and its dependent rows) whose TTL has elapsed.
/// Called lazily from accessors; TTL expiry is authoritative.
fn purge_expired(conn: &Connection) -> Result<(), StorageError> {
    let now = Utc::now().timestamp();
    conn.execute(
        "DELETE FROM messages WHERE session_id IN (SELECT id FROM sessions WHERE expires_at < ?1)",
        params![now],
    )?;
    conn.execute(
        "DELETE FROM context WHERE session_id IN (SELECT id FROM sessions WHERE expires_at < ?1)",
        params![now],
    )?;
    conn.execute(
        "DELETE FROM workflows WHERE session_id IN (SELECT id FROM sessions WHERE expires_at < ?1)",
        params![now],
    )?;
    conn.execute("DELETE FROM sessions WHERE expires_at < ?1", params![now])?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let created: String = row.get(1)?;
    let updated: String = row.get(2)?;
    let status: String = row.get(5)?;
    Ok(Session {
        id: row.get(0)?,
        created_at: created
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        updated_at: updated
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        message_count: row.get::<_, i64>(3)? as usize,
        active_workflow: row.get(4)?,
        status: SessionStatus::parse(&status),
    })
}

#[async_trait]
impl SessionBackend for SqliteBackend {
    async fn create_session(&self, session: Session) -> Result<(), StorageError> {
        let expires = self.expires_at();
        self.with_conn(move |conn| {
            purge_expired(conn)?;
            conn.execute(
                "INSERT OR IGNORE INTO sessions
                     (id, created_at, updated_at, message_count, active_workflow, status, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.id,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                    session.message_count as i64,
                    session.active_workflow,
                    session.status.as_str(),
                    expires,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StorageError> {
        let id = id.to_string();
        let expires = self.expires_at();
        self.with_conn(move |conn| {
            purge_expired(conn)?;
            let session = conn
                .query_row(
                    "SELECT id, created_at, updated_at, message_count, active_workflow, status
                     FROM sessions WHERE id = ?1",
                    params![id],
                    row_to_session,
                )
                .optional()?;
            if session.is_some() {
                // Refresh TTL on access.
                conn.execute(
                    "UPDATE sessions SET expires_at = ?1 WHERE id = ?2",
                    params![expires, id],
                )?;
            }
            Ok(session)
        })
        .await
    }

    async fn update_session(
        &self,
        id: &str,
        active_workflow: Option<Option<String>>,
        status: Option<SessionStatus>,
    ) -> Result<(), StorageError> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            if let Some(workflow) = active_workflow {
                conn.execute(
                    "UPDATE sessions SET active_workflow = ?1, updated_at = ?2 WHERE id = ?3",
                    params![workflow, now, id],
                )?;
            }
            if let Some(status) = status {
                conn.execute(
                    "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), now, id],
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn append_message(&self, id: &str, message: StoredMessage) -> Result<(), StorageError> {
        let id = id.to_string();
        let max = self.max_messages;
        let expires = self.expires_at();
        self.with_conn(move |conn| {
            let metadata = message.metadata.to_string();
            conn.execute_batch("BEGIN")?;
            let result = (|| -> Result<(), StorageError> {
                conn.execute(
                    "INSERT INTO messages (session_id, id, role, content, timestamp, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        message.id,
                        message.role,
                        message.content,
                        message.timestamp.to_rfc3339(),
                        metadata,
                    ],
                )?;
                // Evict the oldest entries past the cap.
                conn.execute(
                    "DELETE FROM messages WHERE session_id = ?1 AND seq NOT IN
                         (SELECT seq FROM messages WHERE session_id = ?1
                          ORDER BY seq DESC LIMIT ?2)",
                    params![id, max as i64],
                )?;
                conn.execute(
                    "UPDATE sessions SET
                         message_count = (SELECT COUNT(*) FROM messages WHERE session_id = ?1),
                         updated_at = ?2,
                         expires_at = ?3
                     WHERE id = ?1",
                    params![id, Utc::now().to_rfc3339(), expires],
                )?;
                Ok(())
            })();
            match result {
                Ok(()) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
        .await
    }

    async fn messages(&self, id: &str, limit: Option<usize>) -> Result<Vec<StoredMessage>, StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            purge_expired(conn)?;
            let sql = match limit {
                Some(_) => {
                    "SELECT id, role, content, timestamp, metadata FROM
                         (SELECT * FROM messages WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2)
                     ORDER BY seq ASC"
                }
                None => {
                    "SELECT id, role, content, timestamp, metadata FROM messages
                     WHERE session_id = ?1 AND ?2 >= 0 ORDER BY seq ASC"
                }
            };
            let mut stmt = conn.prepare(sql)?;
            let limit = limit.map(|n| n as i64).unwrap_or(i64::MAX);
            let rows = stmt.query_map(params![id, limit], |row| {
                let timestamp: String = row.get(3)?;
                let metadata: String = row.get(4)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    timestamp: timestamp
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn set_context(&self, id: &str, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let id = id.to_string();
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO context (session_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (session_id, key) DO UPDATE SET value = excluded.value",
                params![id, key, value.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_context(&self, id: &str, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let id = id.to_string();
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM context WHERE session_id = ?1 AND key = ?2",
                    params![id, key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.and_then(|v| serde_json::from_str(&v).ok()))
        })
        .await
    }

    async fn context_map(&self, id: &str) -> Result<HashMap<String, serde_json::Value>, StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT key, value FROM context WHERE session_id = ?1")?;
            let rows = stmt.query_map(params![id], |row| {
                let key: String = row.get(0)?;
                let value: String = row.get(1)?;
                Ok((key, value))
            })?;
            let mut out = HashMap::new();
            for row in rows {
                let (key, value) = row?;
                if let Ok(parsed) = serde_json::from_str(&value) {
                    out.insert(key, parsed);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn save_workflow(&self, id: &str, workflow_id: &str, data: serde_json::Value) -> Result<(), StorageError> {
        let id = id.to_string();
        let workflow_id = workflow_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO workflows (session_id, workflow_id, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT (session_id, workflow_id) DO UPDATE SET data = excluded.data",
                params![id, workflow_id, data.to_string()],
            )?;
            conn.execute(
                "UPDATE sessions SET active_workflow = ?1, updated_at = ?2 WHERE id = ?3",
                params![workflow_id, Utc::now().to_rfc3339(), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_workflow(&self, id: &str, workflow_id: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let id = id.to_string();
        let workflow_id = workflow_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT data FROM workflows WHERE session_id = ?1 AND workflow_id = ?2",
                    params![id, workflow_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.and_then(|v| serde_json::from_str(&v).ok()))
        })
        .await
    }

    async fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
            conn.execute("DELETE FROM context WHERE session_id = ?1", params![id])?;
            conn.execute("DELETE FROM workflows WHERE session_id = ?1", params![id])?;
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }
}

// ── In-memory backend ────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Session>,
    expiry: HashMap<String, DateTime<Utc>>,
    messages: HashMap<String, Vec<StoredMessage>>,
    contexts: HashMap<String, HashMap<String, serde_json::Value>>,
    workflows: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl MemoryState {
    fn purge_expired(&mut self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .expiry
            .iter()
            .filter(|(_, at)| **at < now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.sessions.remove(&id);
            self.expiry.remove(&id);
            self.messages.remove(&id);
            self.contexts.remove(&id);
            self.workflows.remove(&id);
        }
    }
}

/// Non-durable [`SessionBackend`] used when the database cannot be opened.
/// Same interface, data is lost on restart.
pub struct MemoryBackend {
    state: tokio::sync::Mutex<MemoryState>,
    ttl: Duration,
    max_messages: usize,
}

impl MemoryBackend {
    pub fn new(ttl: Duration, max_messages: usize) -> Self {
        Self {
            state: tokio::sync::Mutex::new(MemoryState::default()),
            ttl,
            max_messages,
        }
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn create_session(&self, session: Session) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        let id = session.id.clone();
        state.expiry.insert(id.clone(), Utc::now() + self.ttl);
        state.sessions.entry(id.clone()).or_insert(session);
        state.messages.entry(id.clone()).or_default();
        state.contexts.entry(id.clone()).or_default();
        state.workflows.entry(id).or_default();
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StorageError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        if state.sessions.contains_key(id) {
            state.expiry.insert(id.to_string(), Utc::now() + self.ttl);
        }
        Ok(state.sessions.get(id).cloned())
    }

    async fn update_session(
        &self,
        id: &str,
        active_workflow: Option<Option<String>>,
        status: Option<SessionStatus>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(id) {
            if let Some(workflow) = active_workflow {
                session.active_workflow = workflow;
            }
            if let Some(status) = status {
                session.status = status;
            }
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn append_message(&self, id: &str, message: StoredMessage) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let list = state.messages.entry(id.to_string()).or_default();
        list.push(message);
        if list.len() > self.max_messages {
            let overflow = list.len() - self.max_messages;
            list.drain(0..overflow);
        }
        let count = list.len();
        if let Some(session) = state.sessions.get_mut(id) {
            session.message_count = count;
            session.updated_at = Utc::now();
        }
        state.expiry.insert(id.to_string(), Utc::now() + self.ttl);
        Ok(())
    }

    async fn messages(&self, id: &str, limit: Option<usize>) -> Result<Vec<StoredMessage>, StorageError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        let list = state.messages.get(id).cloned().unwrap_or_default();
        match limit {
            Some(n) if list.len() > n => Ok(list[list.len() - n..].to_vec()),
            _ => Ok(list),
        }
    }

    async fn set_context(&self, id: &str, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .contexts
            .entry(id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_context(&self, id: &str, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .contexts
            .get(id)
            .and_then(|ctx| ctx.get(key))
            .cloned())
    }

    async fn context_map(&self, id: &str) -> Result<HashMap<String, serde_json::Value>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.contexts.get(id).cloned().unwrap_or_default())
    }

    async fn save_workflow(&self, id: &str, workflow_id: &str, data: serde_json::Value) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .workflows
            .entry(id.to_string())
            .or_default()
            .insert(workflow_id.to_string(), data);
        if let Some(session) = state.sessions.get_mut(id) {
            session.active_workflow = Some(workflow_id.to_string());
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_workflow(&self, id: &str, workflow_id: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .workflows
            .get(id)
            .and_then(|map| map.get(workflow_id))
            .cloned())
    }

    async fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.sessions.remove(id);
        state.expiry.remove(id);
        state.messages.remove(id);
        state.contexts.remove(id);
        state.workflows.remove(id);
        Ok(())
    }
}

// ── Facade ───────────────────────────────────────────────────────────────

/// The session store facade used by the orchestrator.
///
/// Wraps a [`SessionBackend`], adds bounded retry on appends, and keeps the
/// idempotent session-creation semantics: creating an existing session is a
/// no-op that returns the same id.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    durable: bool,
}

impl SessionStore {
    /// Open the durable store at `path`, falling back to a non-durable
    /// in-memory store (with a warning) if the database cannot be opened.
    pub fn open(path: &Path, ttl: Duration, max_messages: usize) -> Self {
        match SqliteBackend::open(path, ttl, max_messages) {
            Ok(backend) => {
                log::info!("session store opened at {}", path.display());
                Self {
                    backend: Arc::new(backend),
                    durable: true,
                }
            }
            Err(e) => {
                log::warn!(
                    "session database unavailable ({}), falling back to in-memory storage; \
                     sessions will not survive a restart",
                    e
                );
                Self::in_memory(ttl, max_messages)
            }
        }
    }

    /// Build an explicitly non-durable store.
    pub fn in_memory(ttl: Duration, max_messages: usize) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new(ttl, max_messages)),
            durable: false,
        }
    }

    /// `false` when the store is running on the in-memory fallback.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Create a session, generating an id when none is given.  Idempotent:
    /// an existing session is left untouched and its id returned.
    pub async fn create_session(&self, id: Option<&str>) -> Result<String, StorageError> {
        let id = id
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        self.backend
            .create_session(Session {
                id: id.clone(),
                created_at: now,
                updated_at: now,
                message_count: 0,
                active_workflow: None,
                status: SessionStatus::Active,
            })
            .await?;
        Ok(id)
    }

    pub async fn session_exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.backend.get_session(id).await?.is_some())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, StorageError> {
        self.backend.get_session(id).await
    }

    pub async fn update_session(
        &self,
        id: &str,
        active_workflow: Option<Option<String>>,
        status: Option<SessionStatus>,
    ) -> Result<(), StorageError> {
        self.backend.update_session(id, active_workflow, status).await
    }

    /// Append a message, retrying transient backend failures a bounded
    /// number of times before surfacing [`StorageError::Unavailable`].
    pub async fn append_message(
        &self,
        id: &str,
        role: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<StoredMessage, StorageError> {
        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            metadata,
        };
        let mut last_error = String::new();
        for attempt in 1..=APPEND_RETRIES {
            match self.backend.append_message(id, message.clone()).await {
                Ok(()) => return Ok(message),
                Err(e) => {
                    last_error = e.to_string();
                    log::warn!(
                        "append_message attempt {}/{} failed for session {}: {}",
                        attempt,
                        APPEND_RETRIES,
                        id,
                        last_error
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64)).await;
                }
            }
        }
        Err(StorageError::Unavailable(last_error))
    }

    /// All stored messages for a session, oldest first.
    pub async fn all_messages(&self, id: &str) -> Result<Vec<StoredMessage>, StorageError> {
        self.backend.messages(id, None).await
    }

    /// The last `n` messages, oldest first.
    pub async fn messages(&self, id: &str, n: usize) -> Result<Vec<StoredMessage>, StorageError> {
        self.backend.messages(id, Some(n)).await
    }

    /// The last `n` messages formatted for LLM input (role + content only).
    /// Asking for more messages than exist returns everything.
    pub async fn recent_context(&self, id: &str, n: usize) -> Result<Vec<ChatMessage>, StorageError> {
        let messages = self.messages(id, n).await?;
        Ok(messages
            .into_iter()
            .map(|m| ChatMessage {
                role: match m.role.as_str() {
                    "system" => ChatRole::System,
                    "assistant" => ChatRole::Assistant,
                    _ => ChatRole::User,
                },
                content: m.content,
            })
            .collect())
    }

    pub async fn set_context(&self, id: &str, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.backend.set_context(id, key, value).await
    }

    pub async fn get_context(&self, id: &str, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        self.backend.get_context(id, key).await
    }

    pub async fn context_map(&self, id: &str) -> Result<HashMap<String, serde_json::Value>, StorageError> {
        self.backend.context_map(id).await
    }

    pub async fn save_workflow(&self, id: &str, workflow_id: &str, data: serde_json::Value) -> Result<(), StorageError> {
        self.backend.save_workflow(id, workflow_id, data).await
    }

    pub async fn get_workflow(&self, id: &str, workflow_id: &str) -> Result<Option<serde_json::Value>, StorageError> {
        self.backend.get_workflow(id, workflow_id).await
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        self.backend.delete_session(id).await
    }
}
