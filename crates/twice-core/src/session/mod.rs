//! Live, in-memory coordinator for one review.
//!
//! A [`ReviewSession`] is a cheap handle to a tokio task that exclusively
//! owns the review's [`EventStore`], its in-memory copy of the log, and the
//! set of connected clients. Every operation is a command on that task's
//! queue, so operations on one review apply strictly in arrival order and an
//! accepted event is in the log and broadcast before the next command runs.
//!
//! Commands sent while the task is still loading wait in the queue.

pub mod client;

pub use client::{ChannelClient, ClientGone, ClientHandle, ClientId, ServerMessage};

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::errors::{CoreError, CoreResult};
use crate::events::{missing_from, Event, ReviewIndex};
use crate::store::{AppendOutcome, EventStore};

/// Lifecycle of one session instance. Instances are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Ready,
    /// The initial load failed; operations are refused until close.
    Failed,
    Closing,
    Closed,
}

/// Outcome of attaching a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Events pushed to the client in its resync batch.
    pub sent: usize,
    /// Events the client knew about that the server did not, now stored.
    pub uploaded: usize,
}

/// Called on the session task for every newly stored event.
///
/// Implementations must not block; spawn anything slow.
pub trait EventHook: Send + Sync {
    fn event_accepted(&self, index: ReviewIndex, event: &Event);
}

/// Hook that does nothing.
pub struct NoopHook;

impl EventHook for NoopHook {
    fn event_accepted(&self, _index: ReviewIndex, _event: &Event) {}
}

type Reply<T> = oneshot::Sender<CoreResult<T>>;

enum Command {
    AddClient {
        client: Arc<dyn ClientHandle>,
        known: Vec<Event>,
        reply: Reply<SyncReport>,
    },
    RemoveClient {
        client: ClientId,
        reply: Reply<usize>,
    },
    AddEvent {
        from: Option<ClientId>,
        event: Event,
        reply: Reply<AppendOutcome>,
    },
    Events {
        reply: Reply<Vec<Event>>,
    },
    Close,
}

struct SessionInner {
    index: ReviewIndex,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<SessionState>>,
}

/// Handle to a running session. Clones share the same instance.
#[derive(Clone)]
pub struct ReviewSession {
    inner: Arc<SessionInner>,
}

impl ReviewSession {
    /// Start a session for `index` backed by the store file at `store_path`.
    ///
    /// When `predecessor` is given, the store is not opened until that
    /// instance reports [`SessionState::Closed`].
    pub fn spawn(
        index: ReviewIndex,
        store_path: PathBuf,
        hook: Arc<dyn EventHook>,
        predecessor: Option<watch::Receiver<SessionState>>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Loading);
        let state = Arc::new(state);

        let actor = SessionActor {
            index,
            state: Arc::clone(&state),
            hook,
            store: None,
            log: Vec::new(),
            clients: Vec::new(),
            failure: None,
        };
        tokio::spawn(actor.run(rx, store_path, predecessor));

        Self {
            inner: Arc::new(SessionInner {
                index,
                commands,
                state,
            }),
        }
    }

    #[must_use]
    pub fn index(&self) -> ReviewIndex {
        self.inner.index
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the store has been released.
    pub async fn wait_closed(&self) {
        let mut rx = self.subscribe_state();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Whether both handles refer to the same instance.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach `client` and bring it up to date.
    ///
    /// The client first receives every logged event absent from `known`, as a
    /// single batch. Then each event in `known` goes through the normal
    /// append path in one transaction, so events made offline are stored and
    /// broadcast to the other clients.
    pub async fn add_client(
        &self,
        client: Arc<dyn ClientHandle>,
        known: Vec<Event>,
    ) -> CoreResult<SyncReport> {
        self.request(|reply| Command::AddClient {
            client,
            known,
            reply,
        })
        .await
    }

    /// Detach a client. Returns how many remain. Idempotent.
    pub async fn remove_client(&self, client: ClientId) -> CoreResult<usize> {
        self.request(|reply| Command::RemoveClient { client, reply })
            .await
    }

    /// Store `event` and broadcast it to every client but `from`.
    pub async fn add_event(
        &self,
        from: Option<ClientId>,
        event: Event,
    ) -> CoreResult<AppendOutcome> {
        self.request(|reply| Command::AddEvent { from, event, reply })
            .await
    }

    /// Snapshot of the log as loaded plus everything accepted since.
    pub async fn events(&self) -> CoreResult<Vec<Event>> {
        self.request(|reply| Command::Events { reply }).await
    }

    /// Mark the instance closing and queue the close behind pending work.
    pub(crate) fn begin_close(&self) {
        self.inner.state.send_replace(SessionState::Closing);
        // The task may already be gone; closing twice is harmless.
        let _ = self.inner.commands.send(Command::Close);
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> CoreResult<T> {
        let closed = || CoreError::SessionClosed {
            index: self.inner.index,
        };
        let (reply, rx) = oneshot::channel();
        self.inner.commands.send(make(reply)).map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }
}

struct SessionActor {
    index: ReviewIndex,
    state: Arc<watch::Sender<SessionState>>,
    hook: Arc<dyn EventHook>,
    store: Option<EventStore>,
    log: Vec<Event>,
    clients: Vec<Arc<dyn ClientHandle>>,
    failure: Option<String>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        store_path: PathBuf,
        predecessor: Option<watch::Receiver<SessionState>>,
    ) {
        if let Some(mut previous) = predecessor {
            tracing::debug!(review = %self.index, "Waiting for previous session to close");
            let _ = previous
                .wait_for(|state| *state == SessionState::Closed)
                .await;
        }

        self.load(&store_path);

        while let Some(command) = commands.recv().await {
            match command {
                Command::AddClient {
                    client,
                    known,
                    reply,
                } => {
                    let _ = reply.send(self.add_client(client, known));
                }
                Command::RemoveClient { client, reply } => {
                    let _ = reply.send(Ok(self.remove_client(client)));
                }
                Command::AddEvent { from, event, reply } => {
                    let _ = reply.send(self.add_event(from, event));
                }
                Command::Events { reply } => {
                    let _ = reply.send(self.ready().map(|()| self.log.clone()));
                }
                Command::Close => break,
            }
        }

        self.close();
    }

    fn load(&mut self, store_path: &std::path::Path) {
        let loaded = EventStore::open(store_path).and_then(|store| {
            let log = store.load_all()?;
            Ok((store, log))
        });

        match loaded {
            Ok((store, log)) => {
                tracing::info!(review = %self.index, events = log.len(), "Review loaded");
                self.store = Some(store);
                self.log = log;
                self.transition(SessionState::Ready);
            }
            Err(e) => {
                tracing::error!(review = %self.index, error = %e, "Failed to load review");
                self.failure = Some(format!("{e:#}"));
                self.transition(SessionState::Failed);
            }
        }
    }

    /// Move out of `Loading` unless the registry already started closing.
    fn transition(&self, to: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Loading {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    fn ready(&self) -> CoreResult<()> {
        match &self.failure {
            Some(reason) => Err(CoreError::SessionUnavailable {
                index: self.index,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn store(&self) -> CoreResult<&EventStore> {
        self.ready()?;
        self.store
            .as_ref()
            .ok_or(CoreError::SessionClosed { index: self.index })
    }

    fn add_client(
        &mut self,
        client: Arc<dyn ClientHandle>,
        known: Vec<Event>,
    ) -> CoreResult<SyncReport> {
        self.ready()?;

        let id = client.id();
        self.clients.retain(|c| c.id() != id);
        self.clients.push(Arc::clone(&client));

        let missing: Vec<Event> = missing_from(&self.log, &known).cloned().collect();
        let sent = missing.len();
        tracing::debug!(review = %self.index, client = %id, sent, "Resyncing client");
        self.push(client.as_ref(), &ServerMessage::Resync(missing));

        let outcomes = self.store()?.append_all(&known).map_err(|e| {
            tracing::error!(review = %self.index, client = %id, error = %e, "Failed to store client events");
            e
        })?;

        let mut uploaded = 0;
        for (event, outcome) in known.into_iter().zip(outcomes) {
            if outcome == AppendOutcome::Inserted {
                uploaded += 1;
                self.accept(Some(id), event);
            }
        }
        if uploaded > 0 {
            tracing::info!(review = %self.index, client = %id, uploaded, "Stored offline events");
        }

        Ok(SyncReport { sent, uploaded })
    }

    fn remove_client(&mut self, client: ClientId) -> usize {
        self.clients.retain(|c| c.id() != client);
        self.clients.len()
    }

    fn add_event(&mut self, from: Option<ClientId>, event: Event) -> CoreResult<AppendOutcome> {
        let outcome = self.store()?.append(&event).map_err(|e| {
            tracing::error!(review = %self.index, event = %event.key(), error = %e, "Failed to store event");
            e
        })?;

        match outcome {
            AppendOutcome::Inserted => self.accept(from, event),
            AppendOutcome::AlreadyExists => {
                tracing::debug!(review = %self.index, event = %event.key(), "Duplicate event ignored");
            }
        }
        Ok(outcome)
    }

    /// Record a freshly stored event, run its side effects, and fan it out.
    fn accept(&mut self, from: Option<ClientId>, event: Event) {
        tracing::debug!(
            review = %self.index,
            id = event.id,
            kind = %event.kind,
            user = %event.user,
            "event"
        );
        self.hook.event_accepted(self.index, &event);

        let text = match ServerMessage::Event(event.clone()).to_text() {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::error!(review = %self.index, error = %e, "Failed to encode event");
                None
            }
        };
        self.log.push(event);

        if let Some(text) = text {
            for client in self.clients.iter().filter(|c| Some(c.id()) != from) {
                if let Err(e) = client.send(&text) {
                    tracing::debug!(review = %self.index, error = %e, "Dropped broadcast");
                }
            }
        }
    }

    fn push(&self, client: &dyn ClientHandle, message: &ServerMessage) {
        let sent = message.to_text().map_err(|e| e.to_string()).and_then(|text| {
            client.send(&text).map_err(|e| e.to_string())
        });
        if let Err(e) = sent {
            tracing::debug!(review = %self.index, client = %client.id(), error = %e, "Failed to push to client");
        }
    }

    fn close(mut self) {
        if !self.clients.is_empty() {
            tracing::warn!(
                review = %self.index,
                clients = self.clients.len(),
                "Closing review with clients still attached"
            );
            self.clients.clear();
        }
        drop(self.store.take());
        self.state.send_replace(SessionState::Closed);
        tracing::info!(review = %self.index, "Review closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::review_store_path;
    use crate::testing::{CountingHook, RecordingClient};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn ev(id: f64, user: &str) -> Event {
        Event::new(id, "comment", user, json!({ "text": id }))
    }

    fn spawn_at(dir: &TempDir, index: i64) -> ReviewSession {
        let index = ReviewIndex(index);
        ReviewSession::spawn(
            index,
            review_store_path(dir.path(), index),
            Arc::new(NoopHook),
            None,
        )
    }

    fn seed(dir: &TempDir, index: i64, events: &[Event]) {
        let store = EventStore::open(&review_store_path(dir.path(), ReviewIndex(index))).unwrap();
        store.append_all(events).unwrap();
    }

    #[tokio::test]
    async fn test_resync_sends_only_missing_in_log_order() {
        let dir = tempdir().unwrap();
        seed(&dir, 1, &[ev(3.0, "a"), ev(1.0, "b"), ev(2.0, "a")]);
        let session = spawn_at(&dir, 1);

        let client = RecordingClient::new();
        let report = session
            .add_client(client.clone(), vec![ev(1.0, "B")])
            .await
            .unwrap();

        assert_eq!(report, SyncReport { sent: 2, uploaded: 0 });
        let frames = client.frames();
        assert_eq!(frames.len(), 1);
        let ids: Vec<f64> = frames[0]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_f64().unwrap())
            .collect();
        assert_eq!(ids, vec![3.0, 2.0]);
    }

    #[tokio::test]
    async fn test_resync_with_nothing_missing_sends_empty_batch() {
        let dir = tempdir().unwrap();
        let session = spawn_at(&dir, 1);

        let client = RecordingClient::new();
        session.add_client(client.clone(), vec![]).await.unwrap();

        assert_eq!(client.frames(), vec![json!([])]);
    }

    #[tokio::test]
    async fn test_add_event_broadcasts_to_others_only() {
        let dir = tempdir().unwrap();
        let session = spawn_at(&dir, 1);
        let a = RecordingClient::new();
        let b = RecordingClient::new();
        session.add_client(a.clone(), vec![]).await.unwrap();
        session.add_client(b.clone(), vec![]).await.unwrap();

        let event = ev(5.0, "a");
        let outcome = session.add_event(Some(a.id()), event.clone()).await.unwrap();

        assert_eq!(outcome, AppendOutcome::Inserted);
        assert_eq!(a.frames().len(), 1);
        assert_eq!(b.frames()[1], serde_json::to_value(&event).unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_event_is_not_rebroadcast() {
        let dir = tempdir().unwrap();
        let session = spawn_at(&dir, 1);
        let watcher = RecordingClient::new();
        session.add_client(watcher.clone(), vec![]).await.unwrap();

        let first = session.add_event(None, ev(1.0, "a")).await.unwrap();
        let second = session.add_event(None, ev(1.0, "A")).await.unwrap();

        assert_eq!(first, AppendOutcome::Inserted);
        assert_eq!(second, AppendOutcome::AlreadyExists);
        assert_eq!(session.events().await.unwrap().len(), 1);
        assert_eq!(watcher.frames().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_events_are_uploaded_and_broadcast() {
        let dir = tempdir().unwrap();
        seed(&dir, 1, &[ev(1.0, "a")]);
        let session = spawn_at(&dir, 1);

        let other = RecordingClient::new();
        session.add_client(other.clone(), vec![]).await.unwrap();

        let returning = RecordingClient::new();
        let report = session
            .add_client(returning.clone(), vec![ev(1.0, "a"), ev(2.0, "b")])
            .await
            .unwrap();

        assert_eq!(report, SyncReport { sent: 0, uploaded: 1 });
        assert_eq!(returning.frames(), vec![json!([])]);
        assert_eq!(other.frames().len(), 2);
        assert_eq!(other.frames()[1]["id"], 2.0);
        assert_eq!(session.events().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_commands_during_loading_apply_in_order() {
        let dir = tempdir().unwrap();
        let session = spawn_at(&dir, 1);
        assert_eq!(session.state(), SessionState::Loading);

        let (first, second, log) = tokio::join!(
            session.add_event(None, ev(2.0, "a")),
            session.add_event(None, ev(1.0, "a")),
            session.events(),
        );
        first.unwrap();
        second.unwrap();

        let ids: Vec<f64> = log.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2.0, 1.0]);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_remove_client_is_idempotent() {
        let dir = tempdir().unwrap();
        let session = spawn_at(&dir, 1);
        let a = RecordingClient::new();
        let b = RecordingClient::new();
        session.add_client(a.clone(), vec![]).await.unwrap();
        session.add_client(b.clone(), vec![]).await.unwrap();

        assert_eq!(session.remove_client(a.id()).await.unwrap(), 1);
        assert_eq!(session.remove_client(a.id()).await.unwrap(), 1);

        session.add_event(None, ev(1.0, "x")).await.unwrap();
        assert_eq!(a.frames().len(), 1);
        assert_eq!(b.frames().len(), 2);
    }

    #[tokio::test]
    async fn test_hook_sees_each_new_event_once() {
        let dir = tempdir().unwrap();
        let hook = Arc::new(CountingHook::default());
        let session = ReviewSession::spawn(
            ReviewIndex(4),
            review_store_path(dir.path(), ReviewIndex(4)),
            hook.clone(),
            None,
        );

        session.add_event(None, ev(1.0, "a")).await.unwrap();
        session.add_event(None, ev(1.0, "a")).await.unwrap();
        session
            .add_client(RecordingClient::new(), vec![ev(1.0, "a"), ev(2.0, "a")])
            .await
            .unwrap();

        assert_eq!(hook.count(), 2);
    }

    fn drop_log_table(dir: &TempDir, index: i64) {
        let conn =
            rusqlite::Connection::open(review_store_path(dir.path(), ReviewIndex(index))).unwrap();
        conn.execute_batch("DROP TABLE log").unwrap();
    }

    #[tokio::test]
    async fn test_append_failure_changes_nothing() {
        let dir = tempdir().unwrap();
        seed(&dir, 1, &[ev(1.0, "a")]);
        let hook = Arc::new(CountingHook::default());
        let session = ReviewSession::spawn(
            ReviewIndex(1),
            review_store_path(dir.path(), ReviewIndex(1)),
            hook.clone(),
            None,
        );
        let watcher = RecordingClient::new();
        session.add_client(watcher.clone(), vec![]).await.unwrap();
        drop_log_table(&dir, 1);

        let err = session.add_event(None, ev(2.0, "b")).await.unwrap_err();

        assert!(matches!(err, CoreError::Internal(_)), "{err}");
        assert_eq!(session.events().await.unwrap(), vec![ev(1.0, "a")]);
        assert_eq!(watcher.frames().len(), 1);
        assert_eq!(hook.count(), 0);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_upload_failure_changes_nothing() {
        let dir = tempdir().unwrap();
        seed(&dir, 1, &[ev(1.0, "a")]);
        let session = spawn_at(&dir, 1);
        let watcher = RecordingClient::new();
        session.add_client(watcher.clone(), vec![]).await.unwrap();
        drop_log_table(&dir, 1);

        let returning = RecordingClient::new();
        let err = session
            .add_client(returning.clone(), vec![ev(1.0, "a"), ev(2.0, "b")])
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Internal(_)), "{err}");
        // The resync batch went out before the upload was attempted.
        assert_eq!(returning.frames(), vec![json!([])]);
        assert_eq!(watcher.frames().len(), 1);
        assert_eq!(session.events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_refuses_operations() {
        let dir = tempdir().unwrap();
        // A directory where the store file should be makes opening fail.
        std::fs::create_dir_all(review_store_path(dir.path(), ReviewIndex(9))).unwrap();
        let session = spawn_at(&dir, 9);

        let err = session.add_event(None, ev(1.0, "a")).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionUnavailable { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session
            .add_client(RecordingClient::new(), vec![])
            .await
            .is_err());
        assert_eq!(session.remove_client(ClientId::next()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_and_refuses() {
        let dir = tempdir().unwrap();
        let session = spawn_at(&dir, 1);
        session.add_event(None, ev(1.0, "a")).await.unwrap();

        session.begin_close();
        session.wait_closed().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.events().await,
            Err(CoreError::SessionClosed { .. })
        ));

        let reopened = spawn_at(&dir, 1);
        assert_eq!(reopened.events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_successor_waits_for_predecessor() {
        let dir = tempdir().unwrap();
        let first = spawn_at(&dir, 1);
        first.add_event(None, ev(1.0, "a")).await.unwrap();
        first.begin_close();

        let second = ReviewSession::spawn(
            ReviewIndex(1),
            review_store_path(dir.path(), ReviewIndex(1)),
            Arc::new(NoopHook),
            Some(first.subscribe_state()),
        );
        let log = second.events().await.unwrap();

        assert_eq!(first.state(), SessionState::Closed);
        assert_eq!(log.len(), 1);
    }
}
