//! Outbound notifications about review activity.
//!
//! New reviews and joining reviewers are mailed immediately. Status changes
//! go through the [`ThrottleQueue`] so that a reviewer flipping a status
//! several times in a minute produces one mail with the final state.

mod activity;

pub use activity::{activity_worker, ActivityQueue, ReviewActivity};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CoreResult;
use crate::events::ReviewIndex;
use crate::metadata::{email_key, Review, ReviewRef, ReviewStore, User};
use crate::throttle::{ThrottleHandler, ThrottleQueue, ThrottledEntry};

/// Public host the clients reach the server on, used in review links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub name: String,
    pub port: Option<u16>,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            port: Some(3000),
        }
    }
}

impl HostInfo {
    fn port_suffix(&self) -> String {
        match self.port {
            Some(port) if port != 80 => format!(":{port}"),
            _ => String::new(),
        }
    }

    /// Link that opens a review in the desktop client.
    #[must_use]
    pub fn review_link(&self, review_id: &str) -> String {
        format!(
            "twiceover://{}{}/review/{review_id}",
            self.name,
            self.port_suffix()
        )
    }

    #[must_use]
    pub fn from_address(&self) -> String {
        format!("\"Twice-Over\" <no-reply@{}>", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub from: String,
    pub reply_to: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
}

/// Delivers composed mail.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: Mail) -> Result<()>;
}

/// Sender used when no mail server is configured: records the mail in the log.
pub struct LogMailSender;

#[async_trait]
impl MailSender for LogMailSender {
    async fn send(&self, mail: Mail) -> Result<()> {
        tracing::info!(
            subject = %mail.subject,
            recipients = mail.to.len(),
            "Notification (mail delivery disabled)"
        );
        Ok(())
    }
}

/// Payload stored in the throttle queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedNotice {
    review_index: ReviewIndex,
    message: String,
}

pub struct Notifier {
    reviews: Arc<dyn ReviewStore>,
    mail: Arc<dyn MailSender>,
    queue: ThrottleQueue,
    host: HostInfo,
}

impl Notifier {
    pub fn new(
        reviews: Arc<dyn ReviewStore>,
        mail: Arc<dyn MailSender>,
        queue: ThrottleQueue,
        host: HostInfo,
    ) -> Self {
        Self {
            reviews,
            mail,
            queue,
            host,
        }
    }

    /// Start delivering throttled notifications.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.queue.start(Arc::clone(self) as Arc<dyn ThrottleHandler>)
    }

    /// Mail the owner and every reviewer about a new review.
    pub async fn new_review(&self, review: &Review) {
        let subject = format!(
            "New Review {}: {}",
            review.ix,
            review.title.as_deref().unwrap_or_default()
        );
        tracing::info!(review = %review.ix, "notification: newReview");
        self.deliver(&subject, review, false).await;
    }

    /// Mail the owner that someone joined.
    pub async fn reviewer_joined(&self, index: ReviewIndex, reviewer: &str) {
        let subject = format!("Review {index}: {} Joined!", display_name(reviewer));
        self.fetch_and_deliver(&subject, index, true).await;
    }

    pub fn change_review_status(
        &self,
        index: ReviewIndex,
        status: &str,
        status_label: Option<&str>,
    ) -> CoreResult<()> {
        let key = format!("{index}-changeReviewStatus");
        self.enqueue(&key, index, status_label.unwrap_or(status).to_string())
    }

    pub fn change_reviewer_status(
        &self,
        index: ReviewIndex,
        reviewer: &str,
        status: Option<&str>,
        status_label: Option<&str>,
    ) -> CoreResult<()> {
        let key = format!("{index}-changeReviewerStatus-{}", email_key(reviewer));
        let message = format!(
            "{} changed status to {}",
            display_name(reviewer),
            status_label.or(status).unwrap_or_default()
        );
        self.enqueue(&key, index, message)
    }

    fn enqueue(&self, key: &str, index: ReviewIndex, message: String) -> CoreResult<()> {
        let notice = QueuedNotice {
            review_index: index,
            message,
        };
        let payload = serde_json::to_value(&notice).map_err(anyhow::Error::from)?;
        self.queue.add(key, &payload)?;
        Ok(())
    }

    async fn fetch_and_deliver(&self, subject: &str, index: ReviewIndex, owner_only: bool) {
        tracing::info!(review = %index, subject, "notification");
        match self.reviews.get_review(&ReviewRef::Index(index)).await {
            Ok(review) => self.deliver(subject, &review, owner_only).await,
            Err(e) => tracing::error!(review = %index, error = %e, "Failed to load review for notification"),
        }
    }

    async fn deliver(&self, subject: &str, review: &Review, owner_only: bool) {
        let Some(mail) = self.compose(subject, review, owner_only) else {
            tracing::debug!(review = %review.ix, subject, "No recipients for notification");
            return;
        };
        if let Err(e) = self.mail.send(mail).await {
            tracing::error!(review = %review.ix, error = %e, "Failed to send notification");
        }
    }

    /// Build the mail, or `None` when nobody would receive it.
    fn compose(&self, subject: &str, review: &Review, owner_only: bool) -> Option<Mail> {
        let mut to: Vec<String> = review.owner.iter().cloned().collect();
        if !owner_only {
            to.extend(review.reviewers.iter().map(|r| r.name.clone()));
        }
        to.retain(|addr| !addr.trim().is_empty());
        if to.is_empty() {
            return None;
        }

        let mut text = format!("{subject}\n\n{}\n", self.host.review_link(&review.id));
        if let Some(description) = review.description.as_deref().filter(|d| !d.is_empty()) {
            text.push('\n');
            text.push_str(description);
            text.push('\n');
        }

        Some(Mail {
            from: self.host.from_address(),
            reply_to: review.owner.clone(),
            to,
            subject: subject.to_string(),
            text,
        })
    }
}

#[async_trait]
impl ThrottleHandler for Notifier {
    async fn handle(&self, batch: Vec<ThrottledEntry>) {
        for entry in batch {
            let notice: QueuedNotice = match serde_json::from_value(entry.payload) {
                Ok(notice) => notice,
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "Skipping malformed notification");
                    continue;
                }
            };
            let subject = format!("Review {}: {}", notice.review_index, notice.message);
            self.fetch_and_deliver(&subject, notice.review_index, false)
                .await;
        }
    }
}

fn display_name(who: &str) -> String {
    User::parse(who).map_or_else(|_| who.trim().to_string(), |u| u.display_name().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataUpdate, SqliteReviewStore};
    use crate::testing::RecordingMailSender;
    use std::time::Duration;

    const REVIEW_ID: &str = "7kULUz32rDthib47gMQQMoc";

    struct Fixture {
        notifier: Arc<Notifier>,
        reviews: Arc<SqliteReviewStore>,
        mail: Arc<RecordingMailSender>,
        queue: ThrottleQueue,
        index: ReviewIndex,
    }

    async fn fixture() -> Fixture {
        let reviews = Arc::new(SqliteReviewStore::open_in_memory().unwrap());
        let mail = Arc::new(RecordingMailSender::default());
        let queue = ThrottleQueue::open_in_memory(Duration::from_secs(60)).unwrap();
        let index = reviews.get_or_create_review(REVIEW_ID).await.unwrap();
        reviews
            .update_metadata(
                &index.into(),
                &MetadataUpdate {
                    title: Some("CR".into()),
                    description: Some("Please look".into()),
                    owner: Some("Owner <owner@example.com>".into()),
                    ..MetadataUpdate::default()
                },
            )
            .await
            .unwrap();
        reviews
            .add_reviewers(index, &["a@example.com".to_string()])
            .await
            .unwrap();

        let notifier = Arc::new(Notifier::new(
            reviews.clone(),
            mail.clone(),
            queue.clone(),
            HostInfo {
                name: "reviews.example.com".into(),
                port: Some(3000),
            },
        ));
        Fixture {
            notifier,
            reviews,
            mail,
            queue,
            index,
        }
    }

    #[test]
    fn test_review_link_omits_port_80() {
        let mut host = HostInfo {
            name: "h".into(),
            port: Some(80),
        };
        assert_eq!(host.review_link("abc"), "twiceover://h/review/abc");
        host.port = Some(8080);
        assert_eq!(host.review_link("abc"), "twiceover://h:8080/review/abc");
        host.port = None;
        assert_eq!(host.review_link("abc"), "twiceover://h/review/abc");
    }

    #[tokio::test]
    async fn test_new_review_mails_owner_and_reviewers() {
        let f = fixture().await;
        let review = f.reviews.get_review(&f.index.into()).await.unwrap();

        f.notifier.new_review(&review).await;

        let sent = f.mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "New Review 1: CR");
        assert_eq!(sent[0].to, ["Owner <owner@example.com>", "a@example.com"]);
        assert_eq!(sent[0].reply_to.as_deref(), Some("Owner <owner@example.com>"));
        assert!(sent[0]
            .text
            .contains("twiceover://reviews.example.com:3000/review/7kULUz32rDthib47gMQQMoc"));
        assert!(sent[0].text.contains("Please look"));
    }

    #[tokio::test]
    async fn test_reviewer_joined_mails_owner_only() {
        let f = fixture().await;
        f.notifier
            .reviewer_joined(f.index, "Bob Smith <bob@example.com>")
            .await;

        let sent = f.mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Review 1: Bob Smith Joined!");
        assert_eq!(sent[0].to, ["Owner <owner@example.com>"]);
    }

    #[tokio::test]
    async fn test_unknown_review_sends_nothing() {
        let f = fixture().await;
        f.notifier.reviewer_joined(ReviewIndex(42), "x@example.com").await;
        assert!(f.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn test_status_changes_are_throttled_per_key() {
        let f = fixture().await;
        f.notifier
            .change_review_status(f.index, "active", Some("Active"))
            .unwrap();
        f.notifier
            .change_review_status(f.index, "complete", Some("Complete"))
            .unwrap();
        f.notifier
            .change_reviewer_status(f.index, "A <A@example.com>", Some("looksGood"), Some("Looks Good"))
            .unwrap();
        f.notifier
            .change_reviewer_status(f.index, "b@example.com", Some("needsWork"), None)
            .unwrap();

        assert!(f.mail.sent().is_empty());
        assert_eq!(f.queue.pending().unwrap(), 3);

        let batch = f.queue.claim_due(i64::MAX).unwrap();
        let mut keys: Vec<&str> = batch.iter().map(|e| e.key.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            [
                "1-changeReviewStatus",
                "1-changeReviewerStatus-a@example.com",
                "1-changeReviewerStatus-b@example.com",
            ]
        );

        f.notifier.handle(batch).await;

        let mut subjects: Vec<String> = f.mail.sent().into_iter().map(|m| m.subject).collect();
        subjects.sort_unstable();
        assert_eq!(
            subjects,
            [
                "Review 1: A changed status to Looks Good",
                "Review 1: Complete",
                "Review 1: b@example.com changed status to needsWork",
            ]
        );
    }

    #[tokio::test]
    async fn test_mail_failure_is_swallowed() {
        let f = fixture().await;
        f.mail.fail_next();
        f.notifier.reviewer_joined(f.index, "bob@example.com").await;
        assert!(f.mail.sent().is_empty());

        f.notifier.reviewer_joined(f.index, "bob@example.com").await;
        assert_eq!(f.mail.sent().len(), 1);
    }
}
