//! Connected clients as seen by a session.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::Event;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Frames the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// A single event, broadcast from another client.
    Event(Event),
    /// Events a (re)connecting client is missing, in log order.
    Resync(Vec<Event>),
    Error { error: String },
}

impl ServerMessage {
    pub fn error(message: impl fmt::Display) -> Self {
        Self::Error {
            error: message.to_string(),
        }
    }

    /// JSON text frame.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The client's outbound channel is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0} is disconnected")]
pub struct ClientGone(pub ClientId);

/// Something a session can push text frames to.
pub trait ClientHandle: Send + Sync {
    fn id(&self) -> ClientId;

    /// Queue one text frame. Must not block.
    fn send(&self, text: &str) -> Result<(), ClientGone>;
}

/// [`ClientHandle`] backed by an unbounded channel drained by the transport.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    id: ClientId,
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelClient {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ClientId::next(),
                tx,
            },
            rx,
        )
    }
}

impl ClientHandle for ChannelClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn send(&self, text: &str) -> Result<(), ClientGone> {
        self.tx
            .send(text.to_string())
            .map_err(|_| ClientGone(self.id))
    }
}
