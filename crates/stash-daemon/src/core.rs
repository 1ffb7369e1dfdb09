/// StashCore: single-owner event loop for every state mutation.
///
/// The TCP server, the HTTP API, the audio sink and remote reads all funnel
/// into one `mpsc` channel of [`CoreEvent`]s.  Only this loop writes to the
/// [`StateManager`] and only this loop drives the [`AudioSink`], so commands
/// are applied strictly in arrival order.
///
/// Commands are answered before the sink is driven: spawning mpv or opening
/// a stream can take seconds and clients only need to know the command was
/// accepted.  What the sink does afterwards arrives back as
/// `CoreEvent::Media`.
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use stash_proto::persistence::{decode_collection, LocalStore};
use stash_proto::playback::{MediaEvent, PlayRequest, Toggle};
use stash_proto::protocol::Command;
use stash_proto::state::{ChangeOrigin, StateManager, StoreEvent};
use stash_proto::stations::{parse_m3u_from_str, StationCollection, StationRecord, ANONYMOUS};
use stash_proto::{Result, StashError};

use crate::remote::RemoteStore;
use crate::sink::AudioSink;

/// All inputs into the core loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A command from a socket client or the HTTP API.  `reply` is `None`
    /// for fire-and-forget senders.
    Command {
        cmd: Command,
        reply: Option<oneshot::Sender<Result<Reply>>>,
    },
    /// Reported by the audio sink.
    Media(MediaEvent),
    /// Outcome of the remote read started by a sign-in.
    RemoteLoaded {
        account: String,
        result: Result<Option<String>>,
    },
    /// Outcome of seeding a new remote document with `created`.
    RemoteCreated {
        account: String,
        created: StationCollection,
        result: Result<()>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reply {
    Done,
    Imported { added: usize, skipped: usize },
}

/// Sender side for the servers.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<CoreEvent>,
}

impl CoreHandle {
    pub fn new(tx: mpsc::Sender<CoreEvent>) -> Self {
        Self { tx }
    }

    /// Submit `cmd` and wait for the verdict.  Rejections surface as a
    /// [`StashError`] inside the `anyhow::Error`.
    pub async fn request(&self, cmd: Command) -> anyhow::Result<Reply> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(CoreEvent::Command {
                cmd,
                reply: Some(reply),
            })
            .await
            .map_err(|_| anyhow::anyhow!("core loop is not running"))?;
        let verdict = reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("core loop dropped the command"))?;
        Ok(verdict?)
    }
}

/// What the sink has to do once a command has been applied.
#[derive(Debug)]
enum SinkWork {
    Play(PlayRequest),
    Pause,
    Volume(f32),
}

pub struct StashCore<S: AudioSink> {
    state: Arc<StateManager>,
    sink: S,
    store: LocalStore,
    remote: Option<Arc<dyn RemoteStore>>,
    seed: Vec<StationRecord>,
    event_tx: mpsc::Sender<CoreEvent>,
    /// Account whose remote read is in flight.  Results for anyone else are
    /// stale.
    pending_account: Option<String>,
}

impl<S: AudioSink> StashCore<S> {
    pub fn new(
        state: Arc<StateManager>,
        sink: S,
        store: LocalStore,
        remote: Option<Arc<dyn RemoteStore>>,
        seed: Vec<StationRecord>,
        event_tx: mpsc::Sender<CoreEvent>,
    ) -> Self {
        Self {
            state,
            sink,
            store,
            remote,
            seed,
            event_tx,
            pending_account: None,
        }
    }

    /// Run until `Shutdown` or until every sender is gone, then release the
    /// sink.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("StashCore: starting event loop");
        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt).await {
                break;
            }
        }
        self.teardown().await;
        Ok(())
    }

    /// Returns false when the loop should stop.
    async fn handle_event(&mut self, evt: CoreEvent) -> bool {
        match evt {
            CoreEvent::Shutdown => {
                info!("StashCore: shutdown requested");
                return false;
            }
            CoreEvent::Command { cmd, reply } => {
                debug!("StashCore: command {:?}", cmd);
                let outcome = self.handle_command(cmd).await;
                let work = match outcome {
                    Ok((verdict, work)) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(verdict));
                        }
                        work
                    }
                    Err(e) => {
                        warn!("StashCore: command rejected: {}", e);
                        self.state.notice(e.to_string());
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                        None
                    }
                };
                if let Some(work) = work {
                    self.drive_sink(work).await;
                }
            }
            CoreEvent::Media(event) => self.apply_media(event).await,
            CoreEvent::RemoteLoaded { account, result } => {
                self.handle_remote_loaded(account, result).await;
            }
            CoreEvent::RemoteCreated {
                account,
                created,
                result,
            } => self.handle_remote_created(account, created, result).await,
        }
        true
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(Reply, Option<SinkWork>)> {
        let local = StoreEvent::Stations(ChangeOrigin::Local);
        match cmd {
            Command::AddStation { station } => {
                self.state
                    .try_update(local, |s| s.collection.add(station))
                    .await?;
            }
            Command::UpdateStation {
                original_url,
                station,
            } => {
                self.state
                    .try_update(local, |s| s.collection.update(&original_url, station))
                    .await?;
            }
            Command::DeleteStation { url } => {
                // deleting an unknown URL is a silent no-op
                if self.state.read(|s| s.collection.contains(&url)).await {
                    self.state.update(local, |s| s.collection.delete(&url)).await;
                }
            }
            Command::ImportPlaylist { content } => {
                return Ok((self.import_playlist(&content).await, None));
            }
            Command::PlayUrl { url } => {
                let request = self
                    .state
                    .update(StoreEvent::Playback, |s| s.playback.play_from_url(&url))
                    .await?;
                return Ok((Reply::Done, Some(SinkWork::Play(request))));
            }
            Command::Pause => {
                let paused = self
                    .state
                    .try_update(StoreEvent::Playback, |s| {
                        if s.playback.pause() {
                            Ok(())
                        } else {
                            Err(())
                        }
                    })
                    .await
                    .is_ok();
                return Ok((Reply::Done, paused.then_some(SinkWork::Pause)));
            }
            Command::TogglePlayPause => {
                let toggle = self
                    .state
                    .update(StoreEvent::Playback, |s| s.playback.toggle())
                    .await?;
                let work = match toggle {
                    Toggle::Play(request) => SinkWork::Play(request),
                    Toggle::Pause => SinkWork::Pause,
                };
                return Ok((Reply::Done, Some(work)));
            }
            Command::Volume { value } => {
                let volume = self
                    .state
                    .update(StoreEvent::Playback, |s| s.playback.set_volume(value))
                    .await;
                return Ok((Reply::Done, Some(SinkWork::Volume(volume))));
            }
            Command::ToggleMute => {
                let volume = self
                    .state
                    .update(StoreEvent::Playback, |s| s.playback.toggle_mute())
                    .await;
                return Ok((Reply::Done, Some(SinkWork::Volume(volume))));
            }
            Command::OpenAddForm => {
                self.state.update(StoreEvent::Form, |s| s.form.open_add()).await;
            }
            Command::OpenEditForm { url } => {
                self.state
                    .try_update(StoreEvent::Form, |s| s.form.open_edit(&s.collection, &url))
                    .await?;
            }
            Command::UpdateFormField { field, value } => {
                self.state
                    .update(StoreEvent::Form, |s| s.form.update_field(field, value))
                    .await;
            }
            Command::ResetForm => {
                self.state
                    .update(StoreEvent::Form, |s| s.form.reset(&s.collection))
                    .await;
            }
            Command::SubmitForm => {
                self.state
                    .try_update(local, |s| s.form.submit(&mut s.collection))
                    .await?;
            }
            Command::CloseForm => {
                self.state.update(StoreEvent::Form, |s| s.form.close()).await;
            }
            Command::SignIn { email } => {
                let account = email.trim();
                if account.is_empty() {
                    return Err(StashError::MissingIdentity);
                }
                self.sign_in(account.to_string()).await;
            }
            Command::SignOut => self.sign_out().await,
            Command::GetState => {}
        }
        Ok((Reply::Done, None))
    }

    /// Every entry goes through the normal add rules; rejects are counted.
    async fn import_playlist(&mut self, content: &str) -> Reply {
        let records = parse_m3u_from_str(content);
        let total = records.len();
        let outcome = self
            .state
            .try_update(StoreEvent::Stations(ChangeOrigin::Local), |s| {
                let added = records
                    .into_iter()
                    .filter(|record| match s.collection.add(record.clone()) {
                        Ok(()) => true,
                        Err(e) => {
                            debug!("import: skipping {}: {}", record.url, e);
                            false
                        }
                    })
                    .count();
                if added > 0 {
                    Ok(added)
                } else {
                    Err(())
                }
            })
            .await;
        let added = outcome.unwrap_or(0);
        info!("import: {} added, {} skipped", added, total - added);
        Reply::Imported {
            added,
            skipped: total - added,
        }
    }

    async fn drive_sink(&mut self, work: SinkWork) {
        match work {
            SinkWork::Play(request) => {
                if request.replace_source {
                    if let Err(e) = self.sink.stop().await {
                        warn!("sink: failed to release previous source: {}", e);
                    }
                }
                if let Err(e) = self
                    .sink
                    .play(&request.url, request.volume, request.reload)
                    .await
                {
                    self.apply_media(MediaEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                }
            }
            SinkWork::Pause => {
                if let Err(e) = self.sink.pause().await {
                    warn!("sink: pause failed: {}", e);
                }
            }
            SinkWork::Volume(volume) => {
                if let Err(e) = self.sink.set_volume(volume).await {
                    warn!("sink: volume change failed: {}", e);
                }
            }
        }
    }

    async fn apply_media(&mut self, event: MediaEvent) {
        if let MediaEvent::Error { message } = &event {
            warn!("playback error: {}", message);
        }
        self.state
            .update(StoreEvent::Playback, |s| s.playback.apply(&event))
            .await;
    }

    // ── identity ──────────────────────────────────────────────────────────────

    async fn sign_in(&mut self, account: String) {
        info!("sign-in: {}", account);
        self.pending_account = Some(account.clone());

        let Some(remote) = self.remote.clone() else {
            let collection = self.store.load_collection(&account, &self.seed).await;
            self.pending_account = None;
            self.install(collection, None).await;
            return;
        };

        // the loop keeps serving commands while the read is in flight
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = remote.read(&account).await;
            let _ = tx.send(CoreEvent::RemoteLoaded { account, result }).await;
        });
    }

    async fn sign_out(&mut self) {
        info!("sign-out");
        self.pending_account = None;
        let collection = self.store.load_collection(ANONYMOUS, &self.seed).await;
        self.install(collection, None).await;
    }

    async fn handle_remote_loaded(&mut self, account: String, result: Result<Option<String>>) {
        if self.pending_account.as_deref() != Some(account.as_str()) {
            debug!("remote: discarding stale result for {}", account);
            return;
        }
        self.pending_account = None;

        let Some(remote) = self.remote.clone() else {
            return;
        };

        match result.and_then(|doc| doc.map(|raw| decode_collection(&account, &raw)).transpose()) {
            Ok(Some(collection)) => {
                info!("remote: loaded {} stations for {}", collection.len(), account);
                self.install(collection, Some(account)).await;
            }
            Ok(None) => {
                info!("remote: no document for {}, adopting current list", account);
                // mirroring starts once the document exists; an update
                // before that would match no row
                let collection = self
                    .state
                    .update(StoreEvent::Identity, |s| {
                        s.collection.owner = account.clone();
                        s.remote_account = None;
                        s.form.close();
                        s.collection.clone()
                    })
                    .await;
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let result = remote.create(&account, &collection).await;
                    let _ = tx
                        .send(CoreEvent::RemoteCreated {
                            account,
                            created: collection,
                            result,
                        })
                        .await;
                });
            }
            Err(e) => {
                warn!("remote: unusable document for {}, using local copy: {}", account, e);
                let collection = self.store.load_collection(&account, &self.seed).await;
                self.install(collection, None).await;
            }
        }
    }

    async fn handle_remote_created(
        &mut self,
        account: String,
        created: StationCollection,
        result: Result<()>,
    ) {
        if let Err(e) = result {
            warn!("remote: failed to create document for {}, mirroring off: {}", account, e);
            return;
        }
        if self.pending_account.is_some() {
            debug!("remote: another sign-in is in flight, ignoring {}", account);
            return;
        }
        let current = self
            .state
            .read(|s| (s.owner() == account).then(|| s.collection.clone()))
            .await;
        let Some(current) = current else {
            debug!("remote: {} signed out before its document was created", account);
            return;
        };

        info!("remote: document created for {}, mirroring on", account);
        // edits made while the create was in flight still need pushing
        let event = if current == created {
            StoreEvent::Identity
        } else {
            StoreEvent::Stations(ChangeOrigin::Local)
        };
        self.state
            .update(event, |s| s.remote_account = Some(account))
            .await;
    }

    /// Replace the whole collection after an identity change.
    async fn install(&mut self, collection: StationCollection, remote_account: Option<String>) {
        self.state
            .update(StoreEvent::Identity, |s| {
                s.collection = collection;
                s.remote_account = remote_account;
                s.form.close();
            })
            .await;
    }

    async fn teardown(&mut self) {
        info!("StashCore: releasing audio sink");
        if let Err(e) = self.sink.stop().await {
            warn!("sink: stop on exit failed: {}", e);
        }
        self.sink.shutdown().await;
        self.state
            .update(StoreEvent::Playback, |s| s.playback.clear())
            .await;
    }
}
