//! twice-core: real-time sync engine for the twice-over review server.
//!
//! This crate owns the per-review event store, the live review sessions and
//! their registry, the review metadata store, and the debounced notification
//! queue. The transport lives in the `twice-server` binary.

pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod metadata;
pub mod notify;
pub mod registry;
pub mod session;
pub mod store;
pub mod throttle;
