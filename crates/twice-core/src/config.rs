//! Server configuration file (`config.json`).
//!
//! Every field has a default, so an absent file or a partial one is fine.
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:3000",
//!   "reviews": { "path": "reviews" },
//!   "host": { "name": "reviews.example.com", "port": 3000 },
//!   "throttleWindowMs": 60000
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::notify::HostInfo;

/// Name of the review metadata database inside the reviews directory.
pub const REVIEWS_DB: &str = "reviews.db";

/// Name of the throttle queue, also its database file stem.
pub const NOTIFICATION_QUEUE: &str = "notifications";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewsConfig {
    /// Directory holding `reviews.db`, the queue file and one `<ix>.db` per review.
    pub path: PathBuf,
}

impl Default for ReviewsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("reviews"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub listen: String,
    pub reviews: ReviewsConfig,
    pub host: HostInfo,
    pub throttle_window_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            reviews: ReviewsConfig::default(),
            host: HostInfo::default(),
            throttle_window_ms: 60_000,
        }
    }
}

impl ServerConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Check values that parse but cannot run. Call again after overrides.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.throttle_window_ms > 0,
            "throttleWindowMs must be greater than zero"
        );
        Ok(())
    }

    #[must_use]
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }

    #[must_use]
    pub fn reviews_db_path(&self) -> PathBuf {
        self.reviews.path.join(REVIEWS_DB)
    }

    #[must_use]
    pub fn notifications_db_path(&self) -> PathBuf {
        self.reviews.path.join(format!("{NOTIFICATION_QUEUE}.db"))
    }
}
