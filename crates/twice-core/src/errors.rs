//! Typed error types for the twice-core service layer.

use thiserror::Error;

use crate::events::ReviewIndex;

/// Result type alias for core service operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the twice-core service layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No review matches the given id or index.
    #[error("No review found with ID {review}")]
    UnknownReview { review: String },

    /// The public review id is malformed.
    #[error("Invalid review ID: {review_id}")]
    InvalidReviewId { review_id: String },

    /// A metadata update carried no recognised fields.
    #[error("No metadata given to update!")]
    EmptyMetadataUpdate,

    /// The session task for this review has exited.
    #[error("Session for review {index} is closed")]
    SessionClosed { index: ReviewIndex },

    /// The session failed to load its event log and cannot serve requests.
    #[error("Review {index} is unavailable: {reason}")]
    SessionUnavailable { index: ReviewIndex, reason: String },

    /// The client sent something that is not a valid protocol message.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// An event arrived before the connection was bound to a review.
    #[error("No review is loaded on this connection")]
    NotBound,

    /// An internal storage or database error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(err.into())
    }
}
