//! SQLite-backed session store.
//!
//! # Schema
//! - `sessions`: one row per session (status, sandbox binding, activity).
//! - `events`: journaled agent events keyed by (session_id, seq); see
//!   [`crate::journal`].
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.  A
//! `PRAGMA integrity_check` runs at open and failure is a startup error.
//!
//! The store owns the single connection; everything above shares it as
//! [`SharedStore`] (a tokio mutex — all queries are short and synchronous).

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("Invalid stored value: {0}")]
    InvalidData(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to the store used by the hub, journal, reaper and HTTP API.
pub type SharedStore = Arc<tokio::sync::Mutex<Store>>;

// ---------------------------------------------------------------------------
// Session model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Chat,
    Code,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Chat => "chat",
            SessionMode::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(SessionMode::Chat),
            "code" => Some(SessionMode::Code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Creating,
    Active,
    Idle,
    Archived,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Archived => "archived",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(SessionStatus::Creating),
            "active" => Some(SessionStatus::Active),
            "idle" => Some(SessionStatus::Idle),
            "archived" => Some(SessionStatus::Archived),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

/// One session row.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub sandbox_provider: Option<String>,
    pub sandbox_provider_id: Option<String>,
    pub environment_id: Option<String>,
    pub repo_id: Option<String>,
    pub name: Option<String>,
    pub first_user_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// True when the session has a sandbox binding the hub can attach to.
    pub fn has_sandbox(&self) -> bool {
        self.sandbox_provider.is_some() && self.sandbox_provider_id.is_some()
    }
}

/// Fields supplied when creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub mode: SessionMode,
    pub environment_id: Option<String>,
    pub repo_id: Option<String>,
    pub sandbox_provider: Option<String>,
    pub sandbox_provider_id: Option<String>,
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at `path`, applying PRAGMAs and schema.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.apply_pragmas()?;
        store.integrity_check()?;
        store.apply_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    /// Wrap in the shared handle used throughout the service.
    pub fn into_shared(self) -> SharedStore {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn integrity_check(&self) -> StoreResult<()> {
        let result: String =
            self.conn
                .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StoreError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Raw connection access for the journal, which shares this store's
    /// database so event appends and session reads stay in one file.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    // -----------------------------------------------------------------------
    // Session CRUD
    // -----------------------------------------------------------------------

    /// Insert a new session with status `creating`.
    pub fn create_session(&self, new: &NewSession) -> StoreResult<Session> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO sessions
                 (id, mode, status, sandbox_provider, sandbox_provider_id,
                  environment_id, repo_id, name, first_user_message,
                  created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?9)",
            params![
                new.id,
                new.mode.as_str(),
                SessionStatus::Creating.as_str(),
                new.sandbox_provider,
                new.sandbox_provider_id,
                new.environment_id,
                new.repo_id,
                new.name,
                now.to_rfc3339(),
            ],
        )?;
        self.get_session(&new.id)?
            .ok_or_else(|| StoreError::InvalidData("session vanished after insert".to_owned()))
    }

    pub fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        self.conn
            .query_row(
                "SELECT id, mode, status, sandbox_provider, sandbox_provider_id,
                        environment_id, repo_id, name, first_user_message,
                        created_at, last_activity_at
                 FROM sessions WHERE id = ?1",
                params![id],
                map_session,
            )
            .optional()
            .map_err(StoreError::from)?
            .transpose()
    }

    pub fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, mode, status, sandbox_provider, sandbox_provider_id,
                    environment_id, repo_id, name, first_user_message,
                    created_at, last_activity_at
             FROM sessions ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], map_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??);
        }
        Ok(sessions)
    }

    /// All sessions currently in the given status (used by the reaper).
    pub fn sessions_with_status(&self, status: SessionStatus) -> StoreResult<Vec<Session>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, mode, status, sandbox_provider, sandbox_provider_id,
                    environment_id, repo_id, name, first_user_message,
                    created_at, last_activity_at
             FROM sessions WHERE status = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![status.as_str()], map_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??);
        }
        Ok(sessions)
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    /// Unconditional status write.  Returns false if the session is unknown.
    pub fn set_status(&self, id: &str, status: SessionStatus) -> StoreResult<bool> {
        let n = self.conn.execute(
            "UPDATE sessions SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Compare-and-swap status transition.
    ///
    /// The reaper idles with `cas_status(id, Active, Idle)` so it cannot race
    /// an activation that already flipped the session back to `active`.
    pub fn cas_status(
        &self,
        id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> StoreResult<bool> {
        let n = self.conn.execute(
            "UPDATE sessions SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Bump `last_activity_at` to now.
    pub fn touch(&self, id: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE sessions SET last_activity_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_name(&self, id: &str, name: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE sessions SET name = ?2 WHERE id = ?1",
            params![id, name],
        )?;
        Ok(())
    }

    /// Record the first user prompt.  First write wins; later prompts are a
    /// no-op.  Returns true when the write took effect.
    pub fn set_first_user_message_if_absent(&self, id: &str, text: &str) -> StoreResult<bool> {
        let n = self.conn.execute(
            "UPDATE sessions SET first_user_message = ?2
             WHERE id = ?1 AND first_user_message IS NULL",
            params![id, text],
        )?;
        Ok(n > 0)
    }

    pub fn set_sandbox_binding(
        &self,
        id: &str,
        provider: &str,
        provider_id: &str,
    ) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE sessions SET sandbox_provider = ?2, sandbox_provider_id = ?3
             WHERE id = ?1",
            params![id, provider, provider_id],
        )?;
        Ok(())
    }

    /// Delete a session row; journaled events cascade.
    pub fn delete_session(&self, id: &str) -> StoreResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

fn map_session(row: &rusqlite::Row<'_>) -> Result<StoreResult<Session>, rusqlite::Error> {
    let mode_str: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let created_at: String = row.get(9)?;
    let last_activity_at: String = row.get(10)?;
    Ok(build_session(
        row.get(0)?,
        mode_str,
        status_str,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        created_at,
        last_activity_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_session(
    id: String,
    mode: String,
    status: String,
    sandbox_provider: Option<String>,
    sandbox_provider_id: Option<String>,
    environment_id: Option<String>,
    repo_id: Option<String>,
    name: Option<String>,
    first_user_message: Option<String>,
    created_at: String,
    last_activity_at: String,
) -> StoreResult<Session> {
    Ok(Session {
        mode: SessionMode::parse(&mode)
            .ok_or_else(|| StoreError::InvalidData(format!("bad mode '{mode}'")))?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidData(format!("bad status '{status}'")))?,
        created_at: parse_timestamp(&created_at)?,
        last_activity_at: parse_timestamp(&last_activity_at)?,
        id,
        sandbox_provider,
        sandbox_provider_id,
        environment_id,
        repo_id,
        name,
        first_user_message,
    })
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{s}': {e}")))
}
