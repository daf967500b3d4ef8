//! Command-line flags. Each one overrides the matching config file field.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use twice_core::config::ServerConfig;

/// Real-time sync server for twice-over reviews
#[derive(Parser, Debug)]
#[command(name = "twice")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a JSON config file
    #[arg(long, env = "TWICE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:3000
    #[arg(long, env = "TWICE_LISTEN")]
    pub listen: Option<String>,

    /// Directory for review databases
    #[arg(long, env = "TWICE_REVIEWS_PATH")]
    pub reviews_path: Option<PathBuf>,

    /// Public host name used in review links
    #[arg(long, env = "TWICE_HOST_NAME")]
    pub host_name: Option<String>,

    /// Public port used in review links
    #[arg(long, env = "TWICE_HOST_PORT")]
    pub host_port: Option<u16>,

    /// Notification debounce window in seconds
    #[arg(long, env = "TWICE_THROTTLE_WINDOW_SECS")]
    pub throttle_window_secs: Option<u64>,

    /// Log output format
    #[arg(long, env = "TWICE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Overlay the flags that were given onto `config`.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = &self.listen {
            config.listen.clone_from(listen);
        }
        if let Some(path) = &self.reviews_path {
            config.reviews.path.clone_from(path);
        }
        if let Some(name) = &self.host_name {
            config.host.name.clone_from(name);
        }
        if let Some(port) = self.host_port {
            config.host.port = Some(port);
        }
        if let Some(secs) = self.throttle_window_secs {
            config.throttle_window_ms = secs.saturating_mul(1000);
        }
    }
}
