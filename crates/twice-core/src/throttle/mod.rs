//! Durable key-based debounce queue.
//!
//! `add(key, payload)` schedules `payload` to be delivered `window` from now.
//! Adding again under the same key before delivery replaces the payload and
//! restarts the window, so a burst of updates collapses into one delivery of
//! the last value. Pending entries live in SQLite and survive a restart.
//!
//! A background task started with [`ThrottleQueue::start`] wakes once
//! immediately and then once per window, claims every entry that has come due,
//! and hands the whole batch to a [`ThrottleHandler`].

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tokio::task::JoinHandle;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS events (
    key TEXT PRIMARY KEY,
    process_time INTEGER NOT NULL,
    data TEXT NOT NULL
);
";

/// One delivered queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottledEntry {
    pub key: String,
    /// Wall-clock milliseconds at which the entry became due.
    pub due_at: i64,
    pub payload: Value,
}

/// Consumer of due entries.
#[async_trait]
pub trait ThrottleHandler: Send + Sync {
    async fn handle(&self, batch: Vec<ThrottledEntry>);
}

struct QueueShared {
    conn: Mutex<Connection>,
    window: Duration,
}

/// Handle to a throttle queue. Cheap to clone.
#[derive(Clone)]
pub struct ThrottleQueue {
    shared: Arc<QueueShared>,
}

impl ThrottleQueue {
    /// Open or create the queue file at `path`.
    pub fn open(path: &Path, window: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directories: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open throttle queue: {}", path.display()))?;
        Self::from_connection(conn, window)
    }

    /// Create an in-memory queue (for testing).
    #[cfg(test)]
    pub fn open_in_memory(window: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn, window)
    }

    fn from_connection(conn: Connection, window: Duration) -> Result<Self> {
        ensure!(!window.is_zero(), "Throttle window must be non-zero");
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize throttle queue schema")?;
        Ok(Self {
            shared: Arc::new(QueueShared {
                conn: Mutex::new(conn),
                window,
            }),
        })
    }

    /// The debounce window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.shared.window
    }

    /// Schedule `payload` under `key`, replacing any pending entry.
    pub fn add(&self, key: &str, payload: &Value) -> Result<()> {
        self.add_at(key, payload, now_ms())
    }

    /// Like [`add`](Self::add) with an explicit clock reading.
    pub fn add_at(&self, key: &str, payload: &Value, now_ms: i64) -> Result<()> {
        let window_ms = i64::try_from(self.shared.window.as_millis()).unwrap_or(i64::MAX);
        let due_at = now_ms.saturating_add(window_ms);
        let data = serde_json::to_string(payload).context("Failed to serialize payload")?;

        self.conn()
            .execute(
                "INSERT OR REPLACE INTO events (key, process_time, data) VALUES (?, ?, ?)",
                params![key, due_at, data],
            )
            .with_context(|| format!("Failed to queue entry {key}"))?;

        tracing::debug!(key, due_at, "Queued throttled entry");
        Ok(())
    }

    /// Remove and return every entry due at or before `now_ms`.
    ///
    /// Select and delete happen in one transaction, so an entry added after the
    /// claim is never lost and never delivered twice.
    pub fn claim_due(&self, now_ms: i64) -> Result<Vec<ThrottledEntry>> {
        let conn = self.conn();
        let tx = conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let rows: Vec<(String, i64, String)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT key, process_time, data FROM events
                     WHERE process_time <= ? ORDER BY process_time ASC",
                )
                .context("Failed to prepare due-entry query")?;
            let rows = stmt
                .query_map([now_ms], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .context("Failed to query due entries")?;
            let collected = rows
                .collect::<rusqlite::Result<_>>()
                .context("Failed to read due entries")?;
            collected
        };

        tx.execute("DELETE FROM events WHERE process_time <= ?", [now_ms])
            .context("Failed to delete due entries")?;
        tx.commit().context("Failed to commit claim")?;

        let entries = rows
            .into_iter()
            .filter_map(|(key, due_at, data)| match serde_json::from_str(&data) {
                Ok(payload) => Some(ThrottledEntry {
                    key,
                    due_at,
                    payload,
                }),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Dropping undecodable throttled entry");
                    None
                }
            })
            .collect();

        Ok(entries)
    }

    /// Number of entries waiting to be delivered.
    pub fn pending(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .context("Failed to count pending entries")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Spawn the delivery loop on the current tokio runtime.
    ///
    /// The first wake happens immediately so entries that came due while the
    /// process was down go out right away. Abort the returned handle to stop.
    pub fn start(&self, handler: Arc<dyn ThrottleHandler>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.window());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(window_ms = queue.window().as_millis(), "Throttle queue started");

            loop {
                ticker.tick().await;
                queue.process_due(handler.as_ref()).await;
            }
        })
    }

    /// Claim what is due now and deliver it. Errors are logged.
    pub async fn process_due(&self, handler: &dyn ThrottleHandler) {
        match self.claim_due(now_ms()) {
            Ok(batch) if batch.is_empty() => {}
            Ok(batch) => {
                tracing::info!(count = batch.len(), "Delivering throttled batch");
                handler.handle(batch).await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to claim throttled entries"),
        }
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.shared
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
