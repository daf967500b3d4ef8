//! Review metadata: title, owner, status and the reviewer list.
//!
//! The event log is the source of truth for what happened in a review; this
//! store is the queryable summary that notifications and listings read. It
//! is written as a side effect of accepting certain events and is allowed to
//! lag behind the log.

pub mod user;

pub use user::{email_key, InvalidUser, User};

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, CoreResult};
use crate::events::{validate_review_id, ReviewIndex};

/// Either form of review reference clients use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewRef {
    Index(ReviewIndex),
    Id(String),
}

impl From<ReviewIndex> for ReviewRef {
    fn from(index: ReviewIndex) -> Self {
        Self::Index(index)
    }
}

impl std::fmt::Display for ReviewRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(ix) => write!(f, "{ix}"),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reviewer {
    /// Display form as last supplied, e.g. `"Bob <bob@example.com>"`.
    pub name: String,
    pub status: Option<String>,
    pub status_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub ix: ReviewIndex,
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub when_created: Option<i64>,
    pub status: String,
    pub status_label: Option<String>,
    pub when_updated: Option<i64>,
    pub reviewers: Vec<Reviewer>,
}

/// Fields to overwrite on a review. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub when_created: Option<i64>,
    pub status: Option<String>,
    pub status_label: Option<String>,
    pub when_updated: Option<i64>,
}

impl MetadataUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerStatusUpdate {
    pub name: String,
    pub status: Option<String>,
    pub status_label: Option<String>,
}

/// Persistent review metadata.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Full record including reviewers.
    async fn get_review(&self, review: &ReviewRef) -> CoreResult<Review>;

    async fn get_review_index(&self, review: &ReviewRef) -> CoreResult<ReviewIndex>;

    /// Index for `review_id`, creating an empty `active` review if needed.
    async fn get_or_create_review(&self, review_id: &str) -> CoreResult<ReviewIndex>;

    /// Overwrite the given fields. Unknown reviews are ignored.
    async fn update_metadata(&self, review: &ReviewRef, update: &MetadataUpdate)
        -> CoreResult<()>;

    /// Add reviewers, rewriting the display form of those already present.
    async fn add_reviewers(&self, index: ReviewIndex, names: &[String]) -> CoreResult<()>;

    /// Set one reviewer's status, adding the reviewer if absent.
    async fn update_reviewer_status(
        &self,
        index: ReviewIndex,
        update: &ReviewerStatusUpdate,
    ) -> CoreResult<()>;
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS reviews (
    ix INTEGER PRIMARY KEY,
    id TEXT UNIQUE,
    title TEXT,
    description TEXT,
    owner TEXT,
    created INTEGER,
    status TEXT NOT NULL DEFAULT 'active',
    statusLabel TEXT,
    updated INTEGER
);

CREATE TABLE IF NOT EXISTS reviewers (
    reviewIndex INTEGER NOT NULL,
    email TEXT NOT NULL COLLATE NOCASE,
    status TEXT,
    statusLabel TEXT,
    PRIMARY KEY (reviewIndex, email)
);
";

/// [`ReviewStore`] on a single SQLite file (`reviews.db`).
pub struct SqliteReviewStore {
    conn: Mutex<Connection>,
}

impl SqliteReviewStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directories: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open review database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize review schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_index(conn: &Connection, review: &ReviewRef) -> rusqlite::Result<Option<ReviewIndex>> {
    let found = match review {
        ReviewRef::Index(ix) => conn
            .query_row("SELECT ix FROM reviews WHERE ix = ?", [ix.0], |row| row.get(0))
            .optional()?,
        ReviewRef::Id(id) => conn
            .query_row("SELECT ix FROM reviews WHERE id = ?", [id], |row| row.get(0))
            .optional()?,
    };
    Ok(found.map(ReviewIndex))
}

fn load_reviewers(conn: &Connection, index: ReviewIndex) -> rusqlite::Result<Vec<Reviewer>> {
    let mut stmt = conn.prepare(
        "SELECT email, status, statusLabel FROM reviewers
         WHERE reviewIndex = ? ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map([index.0], |row| {
        Ok(Reviewer {
            name: row.get(0)?,
            status: row.get(1)?,
            status_label: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Rowid of the reviewer whose stored display form has the same email.
fn find_reviewer(
    conn: &Connection,
    index: ReviewIndex,
    name: &str,
) -> rusqlite::Result<Option<i64>> {
    let wanted = email_key(name);
    let mut stmt = conn.prepare("SELECT rowid, email FROM reviewers WHERE reviewIndex = ?")?;
    let rows = stmt.query_map([index.0], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    for row in rows {
        let (rowid, stored) = row?;
        if email_key(&stored) == wanted {
            return Ok(Some(rowid));
        }
    }
    Ok(None)
}

#[async_trait]
impl ReviewStore for SqliteReviewStore {
    async fn get_review(&self, review: &ReviewRef) -> CoreResult<Review> {
        let conn = self.conn();
        let index = find_index(&conn, review)?.ok_or_else(|| CoreError::UnknownReview {
            review: review.to_string(),
        })?;

        let mut found = conn
            .query_row(
                "SELECT ix, id, title, description, owner, created, status, statusLabel, updated
                 FROM reviews WHERE ix = ?",
                [index.0],
                |row| {
                    Ok(Review {
                        ix: ReviewIndex(row.get(0)?),
                        id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        title: row.get(2)?,
                        description: row.get(3)?,
                        owner: row.get(4)?,
                        when_created: row.get(5)?,
                        status: row.get(6)?,
                        status_label: row.get(7)?,
                        when_updated: row.get(8)?,
                        reviewers: Vec::new(),
                    })
                },
            )
            .with_context(|| format!("Failed to load review {index}"))?;

        found.reviewers = load_reviewers(&conn, index)
            .with_context(|| format!("Failed to load reviewers of review {index}"))?;
        Ok(found)
    }

    async fn get_review_index(&self, review: &ReviewRef) -> CoreResult<ReviewIndex> {
        find_index(&self.conn(), review)?.ok_or_else(|| CoreError::UnknownReview {
            review: review.to_string(),
        })
    }

    async fn get_or_create_review(&self, review_id: &str) -> CoreResult<ReviewIndex> {
        validate_review_id(review_id)?;

        let conn = self.conn();
        let inserted = conn
            .execute("INSERT OR IGNORE INTO reviews (id) VALUES (?)", [review_id])
            .with_context(|| format!("Failed to create review {review_id}"))?;

        let index = find_index(&conn, &ReviewRef::Id(review_id.to_string()))?.ok_or_else(|| {
            CoreError::UnknownReview {
                review: review_id.to_string(),
            }
        })?;

        if inserted > 0 {
            tracing::info!(review_id, index = index.0, "Created review");
        }
        Ok(index)
    }

    async fn update_metadata(
        &self,
        review: &ReviewRef,
        update: &MetadataUpdate,
    ) -> CoreResult<()> {
        if update.is_empty() {
            return Err(CoreError::EmptyMetadataUpdate);
        }

        let conn = self.conn();
        let Some(index) = find_index(&conn, review)? else {
            tracing::debug!(%review, "Ignoring metadata update for unknown review");
            return Ok(());
        };

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        let text_fields = [
            ("title = ?", &update.title),
            ("description = ?", &update.description),
            ("owner = ?", &update.owner),
            ("status = ?", &update.status),
            ("statusLabel = ?", &update.status_label),
        ];
        for (sql, value) in text_fields {
            if let Some(v) = value {
                sets.push(sql);
                values.push(v.clone().into());
            }
        }
        for (sql, value) in [
            ("created = ?", update.when_created),
            ("updated = ?", update.when_updated),
        ] {
            if let Some(v) = value {
                sets.push(sql);
                values.push(v.into());
            }
        }
        values.push(index.0.into());

        let sql = format!("UPDATE reviews SET {} WHERE ix = ?", sets.join(", "));
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .with_context(|| format!("Failed to update metadata of review {index}"))?;
        Ok(())
    }

    async fn add_reviewers(&self, index: ReviewIndex, names: &[String]) -> CoreResult<()> {
        let conn = self.conn();
        let tx = conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        for name in names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            match find_reviewer(&tx, index, name)? {
                Some(rowid) => {
                    tx.execute(
                        "UPDATE reviewers SET email = ? WHERE rowid = ?",
                        params![name, rowid],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT OR IGNORE INTO reviewers (reviewIndex, email) VALUES (?, ?)",
                        params![index.0, name],
                    )?;
                }
            }
        }

        tx.commit()
            .with_context(|| format!("Failed to add reviewers to review {index}"))?;
        Ok(())
    }

    async fn update_reviewer_status(
        &self,
        index: ReviewIndex,
        update: &ReviewerStatusUpdate,
    ) -> CoreResult<()> {
        let name = update.name.trim();
        let conn = self.conn();

        match find_reviewer(&conn, index, name)? {
            Some(rowid) => {
                conn.execute(
                    "UPDATE reviewers SET email = ?, status = ?, statusLabel = ? WHERE rowid = ?",
                    params![name, update.status, update.status_label, rowid],
                )
                .with_context(|| format!("Failed to update reviewer {name}"))?;
            }
            None => {
                conn.execute(
                    "INSERT INTO reviewers (reviewIndex, email, status, statusLabel)
                     VALUES (?, ?, ?, ?)",
                    params![index.0, name, update.status, update.status_label],
                )
                .with_context(|| format!("Failed to add reviewer {name}"))?;
            }
        }
        Ok(())
    }
}
