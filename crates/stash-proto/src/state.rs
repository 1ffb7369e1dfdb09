use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::form::FormSession;
use crate::playback::PlaybackSession;
use crate::stations::StationCollection;

/// Where a station-list change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A user mutation (add / update / delete / import / form submit).
    Local,
    /// Wholesale replacement: identity switch or remote pull.
    Loaded,
}

/// Published after every change to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Stations(ChangeOrigin),
    Playback,
    Form,
    Identity,
    /// A user-facing notice (rejected command, failed lookup, ...).
    Notice(String),
    /// A WARN/ERROR log line, forwarded to connected clients.
    Log(String),
}

/// Everything a UI needs to render.  `rev` grows on every change so clients
/// can spot missed updates and resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppState {
    #[serde(default)]
    pub rev: u64,
    pub collection: StationCollection,
    pub playback: PlaybackSession,
    pub form: FormSession,
    /// Account whose remote document mirrors the collection, once merged.
    #[serde(default)]
    pub remote_account: Option<String>,
}

impl AppState {
    pub fn new(collection: StationCollection, playback: PlaybackSession) -> Self {
        Self {
            rev: 1,
            collection,
            playback,
            form: FormSession::default(),
            remote_account: None,
        }
    }

    pub fn owner(&self) -> &str {
        &self.collection.owner
    }
}

/// Observable container for [`AppState`].
///
/// Mutations run under the write lock, so readers never see half-applied
/// changes.  Each mutation publishes one [`StoreEvent`] after the lock is
/// released.
pub struct StateManager {
    state: Arc<RwLock<AppState>>,
    events: broadcast::Sender<StoreEvent>,
}

impl StateManager {
    pub fn new(initial: AppState) -> Self {
        let (events, _) = broadcast::channel(256);
        Self::with_publisher(initial, events)
    }

    /// Use a channel created elsewhere, so log forwarding can be wired up
    /// before the initial state is loaded.
    pub fn with_publisher(initial: AppState, events: broadcast::Sender<StoreEvent>) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial)),
            events,
        }
    }

    pub async fn snapshot(&self) -> AppState {
        self.state.read().await.clone()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&AppState) -> R) -> R {
        f(&*self.state.read().await)
    }

    /// A new, independent listener.  Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Apply `f` atomically.  If it returns `Ok`, `rev` is bumped and `event`
    /// is published; on `Err` nothing is published and `f` must have left the
    /// state untouched.
    pub async fn try_update<T, E>(
        &self,
        event: StoreEvent,
        f: impl FnOnce(&mut AppState) -> Result<T, E>,
    ) -> Result<T, E> {
        let out = {
            let mut state = self.state.write().await;
            let out = f(&mut state)?;
            state.rev += 1;
            out
        };
        self.publish(event);
        Ok(out)
    }

    pub async fn update<T>(&self, event: StoreEvent, f: impl FnOnce(&mut AppState) -> T) -> T {
        let out = {
            let mut state = self.state.write().await;
            let out = f(&mut state);
            state.rev += 1;
            out
        };
        self.publish(event);
        out
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.publish(StoreEvent::Notice(message.into()));
    }

    fn publish(&self, event: StoreEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
