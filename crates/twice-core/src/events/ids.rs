//! Public review identifiers.
//!
//! Clients mint review IDs themselves as 23-character alphanumeric slugs
//! (e.g. `7kULUz32rDthib47gMQQMoc`). IDs are case-sensitive.

use crate::errors::{CoreError, CoreResult};

/// Length of a public review ID
const REVIEW_ID_LEN: usize = 23;

/// Check if a string looks like a valid review ID
#[must_use]
pub fn is_review_id(s: &str) -> bool {
    s.len() == REVIEW_ID_LEN && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Validate a review ID before it reaches storage.
pub fn validate_review_id(review_id: &str) -> CoreResult<()> {
    if is_review_id(review_id) {
        Ok(())
    } else {
        Err(CoreError::InvalidReviewId {
            review_id: review_id.to_string(),
        })
    }
}
