/// Persistence worker: keeps the local store and the remote mirror in step
/// with the state container.
///
/// Local writes happen inside this one task, so they never interleave.
/// Remote updates are debounced: a burst of edits produces one write,
/// carrying whatever the collection looks like when the quiet period ends.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stash_proto::persistence::LocalStore;
use stash_proto::playback::PlaybackPreferences;
use stash_proto::state::{ChangeOrigin, StateManager, StoreEvent};

use crate::remote::RemoteStore;

pub struct PersistenceWorker {
    state: Arc<StateManager>,
    store: LocalStore,
    remote: Option<Arc<dyn RemoteStore>>,
    debounce: Duration,
    prefs: PlaybackPreferences,
    pending_push: Option<JoinHandle<()>>,
}

impl PersistenceWorker {
    pub fn new(
        state: Arc<StateManager>,
        store: LocalStore,
        remote: Option<Arc<dyn RemoteStore>>,
        debounce: Duration,
        prefs: PlaybackPreferences,
    ) -> Self {
        Self {
            state,
            store,
            remote,
            debounce,
            prefs,
            pending_push: None,
        }
    }

    /// Subscribes before returning, so no change made after this call is
    /// missed.
    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.state.subscribe();
        tokio::spawn(self.run(events))
    }

    async fn run(mut self, mut events: Receiver<StoreEvent>) {
        info!("persistence: worker started");
        loop {
            match events.recv().await {
                Ok(StoreEvent::Stations(origin)) => {
                    self.write_collection().await;
                    if origin == ChangeOrigin::Local {
                        self.schedule_push().await;
                    }
                }
                Ok(StoreEvent::Identity) => self.write_collection().await,
                Ok(StoreEvent::Playback) => self.write_preferences().await,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!("persistence: missed {} events, writing snapshot", n);
                    self.write_collection().await;
                    self.write_preferences().await;
                    self.schedule_push().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("persistence: worker exiting");
    }

    async fn write_collection(&self) {
        let collection = self.state.read(|s| s.collection.clone()).await;
        if let Err(e) = self.store.save_collection(&collection).await {
            warn!("persistence: failed to save stations for {}: {}", collection.owner, e);
        }
    }

    /// Volume and mute only; transport changes are not persisted.
    async fn write_preferences(&mut self) {
        let prefs = self.state.read(|s| PlaybackPreferences::from(&s.playback)).await;
        if prefs == self.prefs {
            return;
        }
        match self.store.save_preferences(&prefs).await {
            Ok(()) => self.prefs = prefs,
            Err(e) => warn!("persistence: failed to save playback preferences: {}", e),
        }
    }

    /// Restart the quiet period.  Only collections mirrored to the signed-in
    /// account are pushed.
    async fn schedule_push(&mut self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let mirrored = self
            .state
            .read(|s| s.remote_account.as_deref() == Some(s.owner()))
            .await;
        if !mirrored {
            return;
        }

        if let Some(previous) = self.pending_push.take() {
            previous.abort();
        }
        let state = self.state.clone();
        let debounce = self.debounce;
        self.pending_push = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let (account, collection) = state
                .read(|s| (s.remote_account.clone(), s.collection.clone()))
                .await;
            let Some(account) = account.filter(|a| *a == collection.owner) else {
                return;
            };
            match remote.update(&account, &collection).await {
                Ok(()) => debug!("remote: pushed {} stations for {}", collection.len(), account),
                Err(e) => warn!("remote: update for {} failed: {}", account, e),
            }
        }));
    }
}
