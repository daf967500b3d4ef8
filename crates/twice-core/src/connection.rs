//! Per-connection protocol handling, independent of the transport.
//!
//! Inbound frames are JSON objects. Those with a `protocol` field of
//! `syncReview` or `loadReview` bind the connection to a review; everything
//! else is an event for the bound review. Failures are answered with
//! `{"error": "..."}` on the same connection.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::errors::{CoreError, CoreResult};
use crate::events::{Event, ReviewIndex};
use crate::metadata::{MetadataUpdate, ReviewRef, ReviewStore};
use crate::registry::{SessionLease, SessionRegistry};
use crate::session::{ClientHandle, ClientId, ServerMessage};

#[derive(Debug, Deserialize)]
struct SyncReview {
    #[serde(rename = "reviewID")]
    review_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    log: Option<Vec<Event>>,
}

#[derive(Debug, Deserialize)]
struct LoadReview {
    #[serde(rename = "reviewID")]
    review_id: String,
    #[serde(default)]
    log: Option<Vec<Event>>,
}

/// One client's protocol state.
pub struct Connection {
    client: Arc<dyn ClientHandle>,
    registry: SessionRegistry,
    reviews: Arc<dyn ReviewStore>,
    bound: Option<SessionLease>,
}

impl Connection {
    pub fn new(
        client: Arc<dyn ClientHandle>,
        registry: SessionRegistry,
        reviews: Arc<dyn ReviewStore>,
    ) -> Self {
        Self {
            client,
            registry,
            reviews,
            bound: None,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client.id()
    }

    /// Review this connection is currently bound to.
    #[must_use]
    pub fn bound_review(&self) -> Option<ReviewIndex> {
        self.bound.as_ref().map(|lease| lease.index())
    }

    /// Handle one text frame, replying with an error frame on failure.
    pub async fn handle_text(&mut self, text: &str) {
        if let Err(e) = self.dispatch(text).await {
            tracing::warn!(client = %self.client_id(), error = %e, "Request failed");
            self.reply(&ServerMessage::error(&e));
        }
    }

    /// Handle one text frame.
    pub async fn dispatch(&mut self, text: &str) -> CoreResult<()> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CoreError::MalformedMessage(e.to_string()))?;

        match value.get("protocol").and_then(Value::as_str) {
            Some("syncReview") => {
                let request: SyncReview = parse(value)?;
                self.sync_review(request).await
            }
            Some("loadReview") => {
                let request: LoadReview = parse(value)?;
                self.load_review(request).await
            }
            _ => {
                let event: Event = parse(value)?;
                self.add_event(event).await
            }
        }
    }

    /// Return the bound review, if any.
    pub async fn close(mut self) {
        if let Some(lease) = self.bound.take() {
            self.registry.release(lease, self.client.id()).await;
        }
    }

    async fn sync_review(&mut self, request: SyncReview) -> CoreResult<()> {
        let index = self.reviews.get_or_create_review(&request.review_id).await?;
        tracing::info!(review = %index, review_id = %request.review_id, "synchronizing review");

        let update = MetadataUpdate {
            title: request.title,
            description: request.description,
            owner: request.owner,
            ..MetadataUpdate::default()
        };
        self.fill_metadata(index, &update).await;

        self.bind(index, request.log.unwrap_or_default()).await
    }

    async fn load_review(&mut self, request: LoadReview) -> CoreResult<()> {
        let index = self
            .reviews
            .get_review_index(&ReviewRef::Id(request.review_id))
            .await?;
        self.bind(index, request.log.unwrap_or_default()).await
    }

    /// Write client-supplied metadata for a review that has no title yet.
    async fn fill_metadata(&self, index: ReviewIndex, update: &MetadataUpdate) {
        if update.is_empty() {
            return;
        }
        let review = ReviewRef::Index(index);
        let result = async {
            if self.reviews.get_review(&review).await?.title.is_none() {
                self.reviews.update_metadata(&review, update).await?;
            }
            Ok::<_, CoreError>(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(review = %index, error = %e, "Failed to record review metadata");
        }
    }

    async fn bind(&mut self, index: ReviewIndex, known: Vec<Event>) -> CoreResult<()> {
        let lease = self.registry.acquire(index);
        if let Some(previous) = self.bound.replace(lease) {
            self.registry.release(previous, self.client.id()).await;
        }

        let Some(lease) = self.bound.as_ref() else {
            return Err(CoreError::NotBound);
        };
        let report = lease.add_client(Arc::clone(&self.client), known).await?;
        tracing::info!(
            review = %index,
            client = %self.client.id(),
            sent = report.sent,
            uploaded = report.uploaded,
            "Client synchronized"
        );
        Ok(())
    }

    async fn add_event(&self, event: Event) -> CoreResult<()> {
        let lease = self.bound.as_ref().ok_or(CoreError::NotBound)?;
        lease.add_event(Some(self.client.id()), event).await?;
        Ok(())
    }

    fn reply(&self, message: &ServerMessage) {
        match message.to_text() {
            Ok(text) => {
                if let Err(e) = self.client.send(&text) {
                    tracing::debug!(error = %e, "Failed to send reply");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode reply"),
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(value: Value) -> CoreResult<T> {
    serde_json::from_value(value).map_err(|e| CoreError::MalformedMessage(e.to_string()))
}
