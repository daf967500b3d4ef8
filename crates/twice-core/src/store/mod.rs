//! Append-only event store for a single review.
//!
//! Each review owns one SQLite file at `<reviews_path>/<index>.db` holding a
//! single `log` table. Rows are replayed in insertion order (`rowid`), never
//! by event id. The `(id, user)` pair is unique with the user compared
//! case-insensitively, so a retried send is recognised as a duplicate and the
//! first write wins.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{ffi, params, Connection};

use crate::events::{canonical_id, Event, ReviewIndex};

/// Schema for a review's event log. Safe to run against an existing file.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS log (
    id TEXT NOT NULL,
    type TEXT NOT NULL,
    user TEXT NOT NULL COLLATE NOCASE,
    data TEXT NOT NULL,
    UNIQUE (id, user) ON CONFLICT ABORT
);
";

/// Result of appending one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// First time this `(id, user)` was seen; the row was written.
    Inserted,
    /// The pair was already recorded. Nothing was written.
    AlreadyExists,
}

/// Path to a review's event store file.
pub fn review_store_path(reviews_path: &Path, index: ReviewIndex) -> PathBuf {
    reviews_path.join(format!("{index}.db"))
}

/// SQLite-backed event log for one review.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open or create the event store at the given path and ensure its schema.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directories: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open event store: {}", path.display()))?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory event store (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create the `log` table if it does not exist yet.
    pub fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_SQL)
            .context("Failed to initialize event log schema")
    }

    /// Append one event.
    pub fn append(&self, event: &Event) -> Result<AppendOutcome> {
        insert_event(&self.conn, event)
    }

    /// Append a batch of events in a single transaction.
    ///
    /// Returns one outcome per input event, in order.
    pub fn append_all(&self, events: &[Event]) -> Result<Vec<AppendOutcome>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let outcomes = events
            .iter()
            .map(|event| insert_event(&tx, event))
            .collect::<Result<Vec<_>>>()?;

        tx.commit().context("Failed to commit event batch")?;
        Ok(outcomes)
    }

    /// Read the full log in insertion order.
    pub fn load_all(&self) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, type, user, data FROM log ORDER BY rowid ASC")
            .context("Failed to prepare log query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query event log")?;

        let mut events = Vec::new();
        for (idx, row) in rows.enumerate() {
            let (id, kind, user, data) =
                row.with_context(|| format!("Failed to read row {idx} from event log"))?;
            let id: f64 = id
                .parse()
                .with_context(|| format!("Invalid event id {id:?} at row {idx}"))?;
            let data = serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse event data at row {idx}"))?;
            events.push(Event {
                id,
                kind,
                user,
                data,
            });
        }

        Ok(events)
    }

    /// Number of events in the log.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM log", [], |row| row.get(0))
            .context("Failed to count events")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn insert_event(conn: &Connection, event: &Event) -> Result<AppendOutcome> {
    let data = serde_json::to_string(&event.data).context("Failed to serialize event data")?;

    match conn.execute(
        "INSERT INTO log (id, type, user, data) VALUES (?, ?, ?, ?)",
        params![canonical_id(event.id), event.kind, event.user, data],
    ) {
        Ok(_) => Ok(AppendOutcome::Inserted),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Ok(AppendOutcome::AlreadyExists)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to append event {}", event.key())),
    }
}
