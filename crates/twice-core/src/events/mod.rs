//! Event types for the review event log.
//!
//! Events are produced by clients and are opaque to the server except for the
//! identity pair `(id, user)` and the handful of `type`s that carry review
//! metadata (see [`ReviewAction`]).

pub mod ids;

pub use ids::{is_review_id, validate_review_id};

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable 1-based index of a review in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewIndex(pub i64);

impl fmt::Display for ReviewIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One user-attributed change submitted to a review's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Client-assigned fractional timestamp. Not unique on its own.
    pub id: f64,
    /// Event type, e.g. `"newReview"` or `"comment"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form identity of the author.
    pub user: String,
    /// Opaque payload
    #[serde(default)]
    pub data: Value,
}

/// Identity of an event for dedup and resync: `(id, user)` with the user
/// compared ASCII case-insensitively, the same folding as the store's
/// `COLLATE NOCASE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    id: String,
    user: String,
}

impl EventKey {
    pub fn new(id: f64, user: &str) -> Self {
        Self {
            id: canonical_id(id),
            user: user.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.user)
    }
}

/// Shortest decimal text that parses back to exactly `id`.
///
/// Event ids are stored as text so fractional precision survives SQLite.
#[must_use]
pub fn canonical_id(id: f64) -> String {
    format!("{id}")
}

impl Event {
    pub fn new(id: f64, kind: impl Into<String>, user: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            user: user.into(),
            data,
        }
    }

    /// Identity key of this event.
    #[must_use]
    pub fn key(&self) -> EventKey {
        EventKey::new(self.id, &self.user)
    }

    /// The id truncated to whole milliseconds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn timestamp_ms(&self) -> i64 {
        self.id.floor() as i64
    }
}

/// Events from `log` whose identity is not in `known`, in log order.
pub fn missing_from<'a>(log: &'a [Event], known: &[Event]) -> impl Iterator<Item = &'a Event> {
    let known: HashSet<EventKey> = known.iter().map(Event::key).collect();
    log.iter().filter(move |event| !known.contains(&event.key()))
}

// ============================================================================
// Metadata-carrying events
// ============================================================================

pub const NEW_REVIEW: &str = "newReview";
pub const REVIEWER_JOINED: &str = "reviewerJoined";
pub const CHANGE_REVIEW_STATUS: &str = "changeReviewStatus";
pub const CHANGE_REVIEWER_STATUS: &str = "changeReviewerStatus";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReview {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_label: Option<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReviewerJoined {
    pub reviewer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReviewStatus {
    pub status: String,
    #[serde(default)]
    pub status_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReviewerStatus {
    pub reviewer: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Older clients send the label as `label`
    #[serde(default, alias = "label")]
    pub status_label: Option<String>,
}

/// The metadata change carried by an event, for the event types that have one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewAction {
    NewReview(NewReview),
    ReviewerJoined(ReviewerJoined),
    ChangeReviewStatus(ChangeReviewStatus),
    ChangeReviewerStatus(ChangeReviewerStatus),
}

impl ReviewAction {
    /// Decode the action carried by `event`.
    ///
    /// Returns `Ok(None)` for event types without metadata side effects and an
    /// error when a known type has a payload of the wrong shape.
    pub fn from_event(event: &Event) -> Result<Option<Self>, serde_json::Error> {
        let data = event.data.clone();
        let action = match event.kind.as_str() {
            NEW_REVIEW => Self::NewReview(serde_json::from_value(data)?),
            REVIEWER_JOINED => Self::ReviewerJoined(serde_json::from_value(data)?),
            CHANGE_REVIEW_STATUS => Self::ChangeReviewStatus(serde_json::from_value(data)?),
            CHANGE_REVIEWER_STATUS => Self::ChangeReviewerStatus(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(action))
    }
}
