//! Process-wide table of live review sessions.
//!
//! Every connection that binds to a review holds a [`SessionLease`]. The
//! first lease for an index starts a session; returning the last one closes
//! it. A closing session is never handed out again: a new `acquire` for the
//! same index starts a fresh instance, which waits for the old one to
//! release its store before loading.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::events::ReviewIndex;
use crate::session::{ClientId, EventHook, ReviewSession, SessionState};
use crate::store::review_store_path;

struct LiveEntry {
    session: ReviewSession,
    leases: usize,
}

#[derive(Default)]
struct RegistryState {
    live: HashMap<ReviewIndex, LiveEntry>,
    retiring: HashMap<ReviewIndex, watch::Receiver<SessionState>>,
    created: u64,
}

struct RegistryShared {
    reviews_path: PathBuf,
    hook: Arc<dyn EventHook>,
    state: Mutex<RegistryState>,
}

/// Cloneable handle to the session table.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl SessionRegistry {
    /// Sessions store their logs under `reviews_path` and report accepted
    /// events to `hook`.
    pub fn new(reviews_path: PathBuf, hook: Arc<dyn EventHook>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                reviews_path,
                hook,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Lease the live session for `index`, starting one if there is none.
    ///
    /// Concurrent callers for the same index always get the same instance.
    pub fn acquire(&self, index: ReviewIndex) -> SessionLease {
        let mut state = self.state();

        if let Some(entry) = state.live.get_mut(&index) {
            entry.leases += 1;
            return SessionLease {
                registry: self.clone(),
                session: entry.session.clone(),
            };
        }

        state
            .retiring
            .retain(|_, rx| *rx.borrow() != SessionState::Closed);
        let predecessor = state.retiring.remove(&index);

        let session = ReviewSession::spawn(
            index,
            review_store_path(&self.shared.reviews_path, index),
            Arc::clone(&self.shared.hook),
            predecessor,
        );
        state.created += 1;
        state.live.insert(
            index,
            LiveEntry {
                session: session.clone(),
                leases: 1,
            },
        );
        tracing::info!(review = %index, live = state.live.len(), "Opened review session");

        SessionLease {
            registry: self.clone(),
            session,
        }
    }

    /// Detach `client` from the leased session and give the lease back.
    pub async fn release(&self, lease: SessionLease, client: ClientId) {
        if let Err(e) = lease.remove_client(client).await {
            tracing::debug!(review = %lease.index(), client = %client, error = %e, "Client removal failed");
        }
        drop(lease);
    }

    /// How many session instances this registry has started.
    #[must_use]
    pub fn sessions_created(&self) -> u64 {
        self.state().created
    }

    /// How many sessions currently hold leases.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.state().live.len()
    }

    fn return_lease(&self, session: &ReviewSession) {
        let index = session.index();
        let mut state = self.state();

        let Some(entry) = state.live.get_mut(&index) else {
            return;
        };
        if !entry.session.same_instance(session) {
            return;
        }

        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases > 0 {
            return;
        }

        if let Some(entry) = state.live.remove(&index) {
            entry.session.begin_close();
            state
                .retiring
                .insert(index, entry.session.subscribe_state());
            tracing::info!(review = %index, live = state.live.len(), "Closing review session");
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One holder's reference to a live session.
///
/// Dropping the lease returns it, so a connection task that dies without
/// calling [`SessionRegistry::release`] still lets the session close.
pub struct SessionLease {
    registry: SessionRegistry,
    session: ReviewSession,
}

impl Deref for SessionLease {
    type Target = ReviewSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.return_lease(&self.session);
    }
}
