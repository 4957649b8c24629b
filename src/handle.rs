//! Contract of the external playback handle: a live connection to one
//! playback device that reports readiness and state changes and accepts
//! connect / disconnect / toggle commands.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::types::ExternalState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    Ready { device_id: String },
    NotReady { device_id: String },
    /// `None` when the handle reports a null state (nothing loaded).
    StateChanged(Option<ExternalState>),
    Error { kind: String, message: String },
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("playback handle is not running")]
    NotRunning,
    #[error("playback command timed out")]
    Timeout,
    #[error("playback command rejected: {0}")]
    Rejected(String),
    #[error("failed to encode bridge command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Supplies the current access token whenever the handle asks for one.
pub type TokenProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Construction options of a playback handle.
#[derive(Clone)]
pub struct PlayerOptions {
    pub name: String,
    pub volume: f32,
    pub token: TokenProvider,
}

impl std::fmt::Debug for PlayerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerOptions")
            .field("name", &self.name)
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait PlaybackHandle: Send + Sync {
    /// Register for events. Events stop when the returned guard is dropped.
    fn subscribe(&self, sink: UnboundedSender<HandleEvent>) -> Subscription;

    async fn connect(&self) -> Result<bool, HandleError>;

    fn disconnect(&self);

    async fn toggle_play(&self) -> Result<(), HandleError>;
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    sinks: Vec<(u64, UnboundedSender<HandleEvent>)>,
}

/// Subscriber registry shared by handle implementations.
#[derive(Clone, Default)]
pub struct Listeners {
    table: Arc<Mutex<ListenerTable>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sink: UnboundedSender<HandleEvent>) -> Subscription {
        let mut table = self.table.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.sinks.push((id, sink));

        Subscription {
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Deliver to every live subscriber, pruning closed ones.
    pub fn emit(&self, event: HandleEvent) {
        let mut table = self.table.lock();
        table.sinks.retain(|(_, sink)| sink.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.table.lock().sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unsubscribe guard returned by [`PlaybackHandle::subscribe`].
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    table: Weak<Mutex<ListenerTable>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().sinks.retain(|(id, _)| *id != self.id);
        }
    }
}
