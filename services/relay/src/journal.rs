//! Append-only per-session event journal.
//!
//! Every agent event (and every journaled client prompt) gets a per-session
//! sequence number assigned inside a single transaction, so for any session
//! the stored `seq` values are exactly `1..=max` with no gaps and no
//! reordering.  Replay reads are plain indexed scans.
//!
//! Pruning only ever touches `archived` sessions: active and idle sessions
//! keep their full history so sleeping clients can always resume.

use crate::store::{SharedStore, Store, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{TransactionBehavior, params};
use thiserror::Error;
use tracing::warn;

/// Bounded retry for transient SQLite busy/locked failures during append.
const APPEND_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// One journaled event.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEvent {
    pub session_id: String,
    pub seq: u64,
    pub event_type: String,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
}

/// Handle over the shared store exposing the journal operations.
#[derive(Clone)]
pub struct Journal {
    store: SharedStore,
}

impl Journal {
    pub fn new(store: SharedStore) -> Self {
        Journal { store }
    }

    /// Append one event, returning its assigned sequence number.
    ///
    /// Sequence allocation and insert run in one immediate transaction;
    /// concurrent appends for the same session serialize on the store lock
    /// and observe distinct, consecutive values.  Transient busy/locked
    /// errors are retried inside this call and never surface.
    pub async fn append(
        &self,
        session_id: &str,
        event_type: &str,
        payload_json: &str,
    ) -> Result<u64, JournalError> {
        let mut store = self.store.lock().await;
        let mut attempt = 0;
        loop {
            match append_once(&mut store, session_id, event_type, payload_json) {
                Ok(seq) => return Ok(seq),
                Err(e) if is_transient(&e) && attempt < APPEND_RETRIES => {
                    attempt += 1;
                    warn!(session_id, attempt, error = %e, "journal append retry");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Events with `seq > after_seq`, ascending.  `limit` bounds the page.
    pub async fn get_after_seq(
        &self,
        session_id: &str,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Vec<JournalEvent>, JournalError> {
        let store = self.store.lock().await;
        let mut stmt = store.conn().prepare(
            "SELECT session_id, seq, type, payload_json, created_at
             FROM events
             WHERE session_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3",
        )?;
        let limit = limit.map_or(i64::MAX, |n| n as i64);
        let rows = stmt.query_map(params![session_id, after_seq as i64, limit], map_event)?;
        collect_events(rows)
    }

    /// The last `n` events for a session, in ascending seq order.
    pub async fn get_recent(
        &self,
        session_id: &str,
        n: usize,
    ) -> Result<Vec<JournalEvent>, JournalError> {
        let store = self.store.lock().await;
        let mut stmt = store.conn().prepare(
            "SELECT session_id, seq, type, payload_json, created_at
             FROM (SELECT session_id, seq, type, payload_json, created_at
                   FROM events WHERE session_id = ?1
                   ORDER BY seq DESC LIMIT ?2)
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![session_id, n as i64], map_event)?;
        collect_events(rows)
    }

    /// Highest assigned seq, or 0 for an empty (or unknown) session.
    pub async fn get_max_seq(&self, session_id: &str) -> Result<u64, JournalError> {
        let store = self.store.lock().await;
        let max: i64 = store.conn().query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(max as u64)
    }

    /// Drop all events for a session.
    pub async fn delete_for_session(&self, session_id: &str) -> Result<u64, JournalError> {
        let store = self.store.lock().await;
        let n = store.conn().execute(
            "DELETE FROM events WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(n as u64)
    }

    /// Delete events older than `cutoff`, but only for archived sessions.
    ///
    /// Active and idle sessions are untouched regardless of event age, so a
    /// disconnected client can still replay after the session wakes.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, JournalError> {
        let store = self.store.lock().await;
        let n = store.conn().execute(
            "DELETE FROM events
             WHERE created_at < ?1
               AND session_id IN (SELECT id FROM sessions WHERE status = 'archived')",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(n as u64)
    }
}

fn append_once(
    store: &mut Store,
    session_id: &str,
    event_type: &str,
    payload_json: &str,
) -> Result<u64, rusqlite::Error> {
    let tx = store
        .conn_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)?;
    let seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO events (session_id, seq, type, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            session_id,
            seq,
            event_type,
            payload_json,
            Utc::now().to_rfc3339()
        ],
    )?;
    tx.commit()?;
    Ok(seq as u64)
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    ) || matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn map_event(row: &rusqlite::Row<'_>) -> Result<JournalEvent, rusqlite::Error> {
    let seq: i64 = row.get(1)?;
    let created_at: String = row.get(4)?;
    Ok(JournalEvent {
        session_id: row.get(0)?,
        seq: seq as u64,
        event_type: row.get(2)?,
        payload_json: row.get(3)?,
        // Timestamps are written by this process as RFC 3339; a parse failure
        // means external corruption and falls back to the epoch.
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

fn collect_events<I>(rows: I) -> Result<Vec<JournalEvent>, JournalError>
where
    I: Iterator<Item = Result<JournalEvent, rusqlite::Error>>,
{
    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}
