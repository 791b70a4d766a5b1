//! SQLite-backed persistent cache for mirrored calendar events.
//!
//! Rows are owned and mutated by the sync engine; `query_window` is the
//! read-only cache reader. Writes are per-row atomic only — the engine's
//! metadata-before-batch ordering substitutes for transactions.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::StoreError;
use crate::types::{Event, EventTime, SyncMetadata};

/// Interface to the persistent cache store.
pub trait EventStore: Send + Sync {
    /// Read a user's sync metadata, if any exists.
    fn sync_metadata(&self, user_id: &str) -> Result<Option<SyncMetadata>, StoreError>;

    /// Write a user's sync metadata. `last_sync_at` must only move forward.
    fn put_sync_metadata(
        &self,
        user_id: &str,
        last_sync_at: DateTime<Utc>,
        sync_token: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Insert or replace the given events for a user.
    fn upsert_events(&self, user_id: &str, events: &[Event]) -> Result<(), StoreError>;

    /// Delete the events with the given ids for a user.
    fn delete_events(&self, user_id: &str, ids: &[String]) -> Result<(), StoreError>;

    /// Remove entries whose effective start precedes `cutoff`. Returns the
    /// number of rows removed.
    fn delete_events_before(&self, user_id: &str, cutoff: DateTime<Utc>)
        -> Result<usize, StoreError>;

    /// Non-cancelled events whose effective start (instant or date) falls in
    /// `[start, end]`, in window order. Empty result is not an error.
    fn query_window(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError>;
}

/// SQLite store for mirrored calendar data.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open (or create) a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory store (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                user_id TEXT PRIMARY KEY,
                last_sync_at INTEGER NOT NULL,
                sync_token TEXT
            );

            CREATE TABLE IF NOT EXISTS events (
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                start_ms INTEGER,
                start_date TEXT,
                status TEXT NOT NULL,
                event_json TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                PRIMARY KEY (id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_events_user_start_ms ON events(user_id, start_ms);
            CREATE INDEX IF NOT EXISTS idx_events_user_start_date ON events(user_id, start_date);
            "#,
        )?;
        Ok(())
    }
}

/// Denormalized sortable start columns: `(start_ms, start_date)`.
fn start_columns(event: &Event) -> (Option<i64>, Option<String>) {
    match &event.start {
        Some(EventTime::DateTime(dt)) => (Some(dt.timestamp_millis()), None),
        Some(EventTime::Date(d)) => (None, Some(d.to_string())),
        None => (None, None),
    }
}

impl EventStore for SqliteEventStore {
    fn sync_metadata(&self, user_id: &str) -> Result<Option<SyncMetadata>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT last_sync_at, sync_token FROM sync_metadata WHERE user_id = ?1")?;

        let mut rows = stmt.query(params![user_id])?;
        if let Some(row) = rows.next()? {
            let last_ms: i64 = row.get(0)?;
            Ok(Some(SyncMetadata {
                user_id: user_id.to_string(),
                last_sync_at: DateTime::from_timestamp_millis(last_ms).unwrap_or_default(),
                sync_token: row.get(1)?,
            }))
        } else {
            Ok(None)
        }
    }

    fn put_sync_metadata(
        &self,
        user_id: &str,
        last_sync_at: DateTime<Utc>,
        sync_token: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.lock().execute(
            r#"
            INSERT OR REPLACE INTO sync_metadata (user_id, last_sync_at, sync_token)
            VALUES (?1, ?2, ?3)
            "#,
            params![user_id, last_sync_at.timestamp_millis(), sync_token],
        )?;
        Ok(())
    }

    fn upsert_events(&self, user_id: &str, events: &[Event]) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();

        for event in events {
            let (start_ms, start_date) = start_columns(event);
            let event_json = serde_json::to_string(event)?;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO events
                (id, user_id, start_ms, start_date, status, event_json, cached_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    event.id,
                    user_id,
                    start_ms,
                    start_date,
                    event.status.as_str(),
                    event_json,
                    now,
                ],
            )?;
        }
        Ok(())
    }

    fn delete_events(&self, user_id: &str, ids: &[String]) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        for id in ids {
            conn.execute(
                "DELETE FROM events WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )?;
        }
        Ok(())
    }

    fn delete_events_before(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let removed = self.conn.lock().execute(
            r#"
            DELETE FROM events
            WHERE user_id = ?1
              AND ((start_ms IS NOT NULL AND start_ms < ?2)
                   OR (start_date IS NOT NULL AND start_date < ?3))
            "#,
            params![
                user_id,
                cutoff.timestamp_millis(),
                cutoff.date_naive().to_string(),
            ],
        )?;
        Ok(removed)
    }

    fn query_window(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT event_json FROM events
            WHERE user_id = ?1
              AND status != 'cancelled'
              AND ((start_ms IS NOT NULL AND start_ms >= ?2 AND start_ms <= ?3)
                   OR (start_date IS NOT NULL AND start_date >= ?4 AND start_date <= ?5))
            ORDER BY (start_ms IS NULL) ASC, start_ms ASC, start_date ASC
            "#,
        )?;

        let rows = stmt.query_map(
            params![
                user_id,
                start.timestamp_millis(),
                end.timestamp_millis(),
                start.date_naive().to_string(),
                end.date_naive().to_string(),
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str(&row?)?);
        }
        Ok(events)
    }
}
