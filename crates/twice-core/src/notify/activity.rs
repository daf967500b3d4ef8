//! Metadata writes and notifications triggered by accepted events.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::CoreResult;
use crate::events::{Event, ReviewAction, ReviewIndex};
use crate::metadata::{MetadataUpdate, ReviewRef, ReviewStore, ReviewerStatusUpdate};
use crate::session::EventHook;

use super::Notifier;

/// Session hook that keeps review metadata in step with the event log.
///
/// Run through an [`ActivityQueue`] after the event has been stored and
/// broadcast. Failures are logged and never retried.
#[derive(Clone)]
pub struct ReviewActivity {
    reviews: Arc<dyn ReviewStore>,
    notifier: Arc<Notifier>,
}

impl ReviewActivity {
    pub fn new(reviews: Arc<dyn ReviewStore>, notifier: Arc<Notifier>) -> Self {
        Self { reviews, notifier }
    }

    /// Apply the side effects of one accepted event.
    pub async fn apply(&self, index: ReviewIndex, event: &Event) -> CoreResult<()> {
        let Some(action) = ReviewAction::from_event(event).map_err(anyhow::Error::from)? else {
            return Ok(());
        };
        let review = ReviewRef::Index(index);

        match action {
            ReviewAction::NewReview(data) => {
                let update = MetadataUpdate {
                    title: data.title,
                    description: data.description,
                    owner: Some(event.user.clone()),
                    when_created: Some(event.timestamp_ms()),
                    status: data.status,
                    status_label: data.status_label,
                    when_updated: None,
                };
                self.reviews.update_metadata(&review, &update).await?;
                if !data.reviewers.is_empty() {
                    self.reviews.add_reviewers(index, &data.reviewers).await?;
                }
                let stored = self.reviews.get_review(&review).await?;
                self.notifier.new_review(&stored).await;
            }
            ReviewAction::ReviewerJoined(data) => {
                self.reviews
                    .add_reviewers(index, std::slice::from_ref(&data.reviewer))
                    .await?;
                self.notifier.reviewer_joined(index, &data.reviewer).await;
            }
            ReviewAction::ChangeReviewStatus(data) => {
                let update = MetadataUpdate {
                    status: Some(data.status.clone()),
                    status_label: data.status_label.clone(),
                    when_updated: Some(event.timestamp_ms()),
                    ..MetadataUpdate::default()
                };
                self.reviews.update_metadata(&review, &update).await?;
                self.notifier.change_review_status(
                    index,
                    &data.status,
                    data.status_label.as_deref(),
                )?;
            }
            ReviewAction::ChangeReviewerStatus(data) => {
                let update = ReviewerStatusUpdate {
                    name: data.reviewer.clone(),
                    status: data.status.clone(),
                    status_label: data.status_label.clone(),
                };
                self.reviews.update_reviewer_status(index, &update).await?;
                self.notifier.change_reviewer_status(
                    index,
                    &data.reviewer,
                    data.status.as_deref(),
                    data.status_label.as_deref(),
                )?;
            }
        }
        Ok(())
    }
}

impl ReviewActivity {
    async fn run(&self, index: ReviewIndex, event: &Event) {
        if let Err(e) = self.apply(index, event).await {
            tracing::warn!(
                review = %index,
                event = %event.key(),
                kind = %event.kind,
                error = %e,
                "Review side effect failed"
            );
        }
    }
}

/// Session hook that feeds accepted events to a single [`activity_worker`].
///
/// Side effects are applied one at a time in the order the sessions accepted
/// their events, so metadata always ends on the latest status.
#[derive(Clone)]
pub struct ActivityQueue {
    jobs: mpsc::UnboundedSender<(ReviewIndex, Event)>,
}

impl ActivityQueue {
    /// Spawn the worker. It exits once every queue handle is dropped.
    pub fn start(activity: ReviewActivity) -> (Self, JoinHandle<()>) {
        let (jobs, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(activity_worker(rx, activity));
        (Self { jobs }, worker)
    }
}

impl EventHook for ActivityQueue {
    fn event_accepted(&self, index: ReviewIndex, event: &Event) {
        if ReviewAction::from_event(event).is_ok_and(|action| action.is_none()) {
            return;
        }
        if self.jobs.send((index, event.clone())).is_err() {
            tracing::warn!(
                review = %index,
                event = %event.key(),
                "Activity worker is gone; side effect dropped"
            );
        }
    }
}

/// Applies queued side effects in arrival order.
pub async fn activity_worker(
    mut rx: mpsc::UnboundedReceiver<(ReviewIndex, Event)>,
    activity: ReviewActivity,
) {
    tracing::info!("Review activity worker started");
    while let Some((index, event)) = rx.recv().await {
        activity.run(index, &event).await;
    }
    tracing::info!("Review activity worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CHANGE_REVIEWER_STATUS, CHANGE_REVIEW_STATUS, NEW_REVIEW, REVIEWER_JOINED};
    use crate::metadata::SqliteReviewStore;
    use crate::notify::HostInfo;
    use crate::testing::RecordingMailSender;
    use crate::throttle::ThrottleQueue;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        activity: ReviewActivity,
        reviews: Arc<SqliteReviewStore>,
        mail: Arc<RecordingMailSender>,
        queue: ThrottleQueue,
        index: ReviewIndex,
    }

    async fn fixture() -> Fixture {
        let reviews = Arc::new(SqliteReviewStore::open_in_memory().unwrap());
        let mail = Arc::new(RecordingMailSender::default());
        let queue = ThrottleQueue::open_in_memory(Duration::from_secs(60)).unwrap();
        let notifier = Arc::new(Notifier::new(
            reviews.clone(),
            mail.clone(),
            queue.clone(),
            HostInfo::default(),
        ));
        let index = reviews
            .get_or_create_review("7kULUz32rDthib47gMQQMoc")
            .await
            .unwrap();
        Fixture {
            activity: ReviewActivity::new(reviews.clone(), notifier),
            reviews,
            mail,
            queue,
            index,
        }
    }

    #[tokio::test]
    async fn test_new_review_writes_metadata_and_mails() {
        let f = fixture().await;
        let event = Event::new(
            1_440_047_582_964.75,
            NEW_REVIEW,
            "John Doe <john.doe@example.com>",
            json!({
                "title": "Test Review",
                "description": "desc",
                "status": "active",
                "statusLabel": "Active",
                "reviewers": ["bob@example.com"]
            }),
        );

        f.activity.apply(f.index, &event).await.unwrap();

        let review = f.reviews.get_review(&f.index.into()).await.unwrap();
        assert_eq!(review.title.as_deref(), Some("Test Review"));
        assert_eq!(review.owner.as_deref(), Some("John Doe <john.doe@example.com>"));
        assert_eq!(review.when_created, Some(1_440_047_582_964));
        assert_eq!(review.status_label.as_deref(), Some("Active"));
        assert_eq!(review.reviewers.len(), 1);

        let sent = f.mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "New Review 1: Test Review");
    }

    #[tokio::test]
    async fn test_reviewer_joined_adds_reviewer() {
        let f = fixture().await;
        let event = Event::new(
            2.0,
            REVIEWER_JOINED,
            "bob@example.com",
            json!({ "reviewer": "Bob <bob@example.com>" }),
        );

        f.activity.apply(f.index, &event).await.unwrap();

        let review = f.reviews.get_review(&f.index.into()).await.unwrap();
        assert_eq!(review.reviewers[0].name, "Bob <bob@example.com>");
        // No owner yet, so nobody to tell
        assert!(f.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn test_status_changes_update_metadata_and_queue() {
        let f = fixture().await;
        f.activity
            .apply(
                f.index,
                &Event::new(
                    3.9,
                    CHANGE_REVIEW_STATUS,
                    "o@example.com",
                    json!({ "status": "complete", "statusLabel": "Complete" }),
                ),
            )
            .await
            .unwrap();
        f.activity
            .apply(
                f.index,
                &Event::new(
                    4.0,
                    CHANGE_REVIEWER_STATUS,
                    "bob@example.com",
                    json!({ "reviewer": "bob@example.com", "status": "looksGood", "label": "Looks Good" }),
                ),
            )
            .await
            .unwrap();

        let review = f.reviews.get_review(&f.index.into()).await.unwrap();
        assert_eq!(review.status, "complete");
        assert_eq!(review.when_updated, Some(3));
        assert_eq!(review.reviewers[0].status.as_deref(), Some("looksGood"));
        assert_eq!(review.reviewers[0].status_label.as_deref(), Some("Looks Good"));

        assert_eq!(f.queue.pending().unwrap(), 2);
        assert!(f.mail.sent().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queued_status_changes_apply_in_order() {
        let f = fixture().await;
        let statuses = ["a", "b", "c", "d", "final"];

        for round in 0..100_u32 {
            let (hook, worker) = ActivityQueue::start(f.activity.clone());
            for (i, status) in (0_u32..).zip(statuses) {
                let event = Event::new(
                    f64::from(round * 10 + i),
                    CHANGE_REVIEW_STATUS,
                    "owner@example.com",
                    json!({ "status": status, "statusLabel": format!("{status} label") }),
                );
                hook.event_accepted(f.index, &event);
            }
            drop(hook);
            worker.await.unwrap();

            let review = f.reviews.get_review(&f.index.into()).await.unwrap();
            assert_eq!(review.status, "final", "round {round}");
            assert_eq!(review.status_label.as_deref(), Some("final label"), "round {round}");
        }

        let due = f.queue.claim_due(i64::MAX).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].payload["message"], "final label");
    }

    #[tokio::test]
    async fn test_queue_skips_plain_events() {
        let f = fixture().await;
        let (hook, worker) = ActivityQueue::start(f.activity.clone());
        hook.event_accepted(f.index, &Event::new(1.0, "comment", "a", json!({})));
        drop(hook);
        worker.await.unwrap();
        assert_eq!(f.queue.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_plain_events_do_nothing() {
        let f = fixture().await;
        f.activity
            .apply(f.index, &Event::new(1.0, "comment", "a", json!({})))
            .await
            .unwrap();
        assert_eq!(f.queue.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_an_error() {
        let f = fixture().await;
        let event = Event::new(1.0, REVIEWER_JOINED, "a", json!({ "nope": 1 }));
        assert!(f.activity.apply(f.index, &event).await.is_err());
    }
}
