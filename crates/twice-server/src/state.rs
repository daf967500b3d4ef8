//! Shared server state wired from the config.

use std::sync::Arc;

use anyhow::{Context, Result};
use twice_core::config::ServerConfig;
use twice_core::metadata::{ReviewStore, SqliteReviewStore};
use twice_core::notify::{ActivityQueue, LogMailSender, Notifier, ReviewActivity};
use twice_core::registry::SessionRegistry;
use twice_core::throttle::ThrottleQueue;

pub struct AppState {
    pub registry: SessionRegistry,
    pub reviews: Arc<dyn ReviewStore>,
    pub notifier: Arc<Notifier>,
}

/// Open the databases under the reviews directory and wire the components.
///
/// The throttle queue is not started here; call [`Notifier::start`].
pub fn build_state(config: &ServerConfig) -> Result<Arc<AppState>> {
    let reviews_path = &config.reviews.path;
    std::fs::create_dir_all(reviews_path).with_context(|| {
        format!(
            "Failed to create reviews directory: {}",
            reviews_path.display()
        )
    })?;
    tracing::info!(path = %reviews_path.display(), "Reviews directory in use");

    let reviews: Arc<dyn ReviewStore> =
        Arc::new(SqliteReviewStore::open(&config.reviews_db_path())?);
    let queue = ThrottleQueue::open(&config.notifications_db_path(), config.throttle_window())?;

    tracing::warn!("Mail delivery is not configured; notifications are only logged");
    let notifier = Arc::new(Notifier::new(
        Arc::clone(&reviews),
        Arc::new(LogMailSender),
        queue,
        config.host.clone(),
    ));

    // The worker lives as long as the registry holds the queue.
    let (activity, _worker) = ActivityQueue::start(ReviewActivity::new(
        Arc::clone(&reviews),
        Arc::clone(&notifier),
    ));
    let registry = SessionRegistry::new(reviews_path.clone(), Arc::new(activity));

    Ok(Arc::new(AppState {
        registry,
        reviews,
        notifier,
    }))
}
