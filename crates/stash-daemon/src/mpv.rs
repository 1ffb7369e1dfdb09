/// mpv as the audio sink, driven over its JSON IPC socket.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← MpvHandle::send() → JSON line → socket
///         └── reader_task   ← JSON lines from socket
///                                ├── reply (request_id) → waiting oneshot
///                                └── event / property-change → MediaTranslator
///                                                                → CoreEvent::Media
/// ```
///
/// mpv is started lazily on the first `play` and killed on shutdown (or when
/// the driver is dropped).
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use stash_proto::platform;
use stash_proto::playback::MediaEvent;

use crate::core::CoreEvent;
use crate::sink::AudioSink;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const OBS_CORE_IDLE: u64 = 1;
const OBS_PAUSE: u64 = 2;
const OBS_PAUSED_FOR_CACHE: u64 = 3;

type Reply = oneshot::Sender<anyhow::Result<Value>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

struct OutgoingRequest {
    req_id: u64,
    line: String,
    reply: Reply,
}

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<OutgoingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
        line.push('\n');

        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(OutgoingRequest {
                req_id,
                line,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.set_property("volume", json!(to_percent(volume))).await
    }

    /// mpv pushes a property-change for each of these right away and then on
    /// every change.  Needed after every fresh connection.
    async fn observe_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
        ];
        for (id, name) in props {
            if let Err(e) = self.send(json!(["observe_property", id, name])).await {
                warn!("mpv: observe_property {} failed: {}", name, e);
            }
        }
    }
}

fn to_percent(volume: f32) -> f64 {
    f64::from((volume * 100.0).clamp(0.0, 100.0))
}

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: platform::mpv_socket_name(),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.kill().await;
        }
    }

    /// Start a fresh mpv (killing any previous one) and connect to its IPC
    /// endpoint.  Unsolicited messages go to `event_tx`.
    pub async fn spawn_and_connect(
        &mut self,
        volume: f32,
        event_tx: mpsc::Sender<Value>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket_name).await;

        let binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: spawning {}", binary.display());

        let child = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(platform::mpv_socket_arg())
            .arg(format!("--volume={}", to_percent(volume).round() as i64))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);

        let handle = self.connect(event_tx).await?;
        handle.observe_properties().await;
        Ok(handle)
    }

    #[cfg(unix)]
    async fn connect(&self, event_tx: mpsc::Sender<Value>) -> anyhow::Result<MpvHandle> {
        use tokio::net::UnixStream;

        let path = std::path::PathBuf::from(&self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if path.exists() {
                if let Ok(stream) = UnixStream::connect(&path).await {
                    info!("mpv: connected to IPC socket");
                    let (read_half, write_half) = stream.into_split();
                    return Ok(start_io_tasks(read_half, write_half, event_tx));
                }
            }
        }
        anyhow::bail!("mpv IPC socket did not appear")
    }

    #[cfg(windows)]
    async fn connect(&self, event_tx: mpsc::Sender<Value>) -> anyhow::Result<MpvHandle> {
        use tokio::net::windows::named_pipe::ClientOptions;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(pipe) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(pipe);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

impl Drop for MpvDriver {
    fn drop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            let _ = child.start_kill();
        }
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<Value>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(writer_task(write_half, rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));
    MpvHandle { tx }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    for (_, reply) in pending.lock().await.drain() {
        let _ = reply.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<Value>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                match val.get("request_id").and_then(Value::as_u64) {
                    Some(req_id) => {
                        let Some(reply) = pending.lock().await.remove(&req_id) else {
                            debug!("mpv reader: reply for unknown req={}", req_id);
                            continue;
                        };
                        let status = val
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string();
                        let result = if status == "success" {
                            Ok(val)
                        } else {
                            Err(anyhow::anyhow!("mpv error: {}", status))
                        };
                        let _ = reply.send(result);
                    }
                    None => {
                        debug!("mpv reader: event {}", trimmed);
                        if event_tx.send(val).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<OutgoingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // registered first so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.line.trim());
        if let Err(e) = writer.write_all(req.line.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(reply) = pending.lock().await.remove(&req.req_id) {
                let _ = reply.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

/// Turns mpv's property changes and file events into [`MediaEvent`]s.
///
/// Nothing is reported until a file has started, so the initial property
/// values mpv pushes while idle are ignored.
#[derive(Debug, Default)]
pub struct MediaTranslator {
    loaded: bool,
    paused: bool,
}

impl MediaTranslator {
    pub fn translate(&mut self, raw: &Value) -> Option<MediaEvent> {
        match raw.get("event")?.as_str()? {
            "property-change" => {
                let id = raw.get("id")?.as_u64()?;
                let data = raw.get("data").unwrap_or(&Value::Null);
                self.property_change(id, data)
            }
            "start-file" => {
                self.loaded = true;
                None
            }
            "end-file" => {
                self.loaded = false;
                match raw.get("reason").and_then(Value::as_str) {
                    Some("eof") => Some(MediaEvent::Pause),
                    Some("error") => Some(MediaEvent::Error {
                        message: raw
                            .get("file_error")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    }),
                    // stop / quit / redirect: we replaced or tore down the
                    // source ourselves
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// True for an `end-file` that leaves nothing to resume (the stream ran
    /// out or failed), as opposed to a source we replaced ourselves.
    pub fn ends_source(raw: &Value) -> bool {
        raw.get("event").and_then(Value::as_str) == Some("end-file")
            && matches!(
                raw.get("reason").and_then(Value::as_str),
                Some("eof" | "error")
            )
    }

    fn property_change(&mut self, id: u64, data: &Value) -> Option<MediaEvent> {
        let flag = data.as_bool()?;
        match id {
            OBS_PAUSE => {
                self.paused = flag;
                if !self.loaded {
                    return None;
                }
                Some(if flag { MediaEvent::Pause } else { MediaEvent::Play })
            }
            OBS_CORE_IDLE if self.loaded && !self.paused => Some(if flag {
                MediaEvent::Waiting
            } else {
                MediaEvent::Playing
            }),
            OBS_PAUSED_FOR_CACHE if flag && self.loaded => Some(MediaEvent::Waiting),
            _ => None,
        }
    }
}

/// [`AudioSink`] backed by an mpv child process.
pub struct MpvSink {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    core_tx: mpsc::Sender<CoreEvent>,
    /// Cleared by the event forwarder when the source ends on its own.
    loaded_url: Arc<Mutex<Option<String>>>,
    volume: f32,
}

impl MpvSink {
    pub fn new(core_tx: mpsc::Sender<CoreEvent>, volume: f32) -> Self {
        Self {
            driver: MpvDriver::new(),
            handle: None,
            core_tx,
            loaded_url: Arc::new(Mutex::new(None)),
            volume,
        }
    }

    async fn ensure_handle(&mut self) -> anyhow::Result<MpvHandle> {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: process died, respawning");
            self.handle = None;
            *self.loaded_url.lock().await = None;
        }
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }

        // one forwarder per connection
        let (event_tx, mut event_rx) = mpsc::channel::<Value>(64);
        let core_tx = self.core_tx.clone();
        let loaded_url = self.loaded_url.clone();
        tokio::spawn(async move {
            let mut translator = MediaTranslator::default();
            while let Some(raw) = event_rx.recv().await {
                if MediaTranslator::ends_source(&raw) {
                    *loaded_url.lock().await = None;
                }
                let Some(event) = translator.translate(&raw) else {
                    continue;
                };
                debug!("mpv: media event {:?}", event);
                if core_tx.send(CoreEvent::Media(event)).await.is_err() {
                    break;
                }
            }
        });

        let handle = self.driver.spawn_and_connect(self.volume, event_tx).await?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

#[async_trait]
impl AudioSink for MpvSink {
    async fn play(&mut self, url: &str, volume: f32, reload: bool) -> anyhow::Result<()> {
        self.volume = volume;
        let handle = self.ensure_handle().await?;
        let must_load = reload || self.loaded_url.lock().await.as_deref() != Some(url);
        if must_load {
            handle.send(json!(["loadfile", url, "replace"])).await?;
            *self.loaded_url.lock().await = Some(url.to_string());
        }
        handle.set_volume(volume).await?;
        handle.set_property("pause", json!(false)).await
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        match &self.handle {
            Some(handle) => handle.set_property("pause", json!(true)).await,
            None => Ok(()),
        }
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        *self.loaded_url.lock().await = None;
        match &self.handle {
            Some(handle) => {
                handle.send(json!(["stop"])).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()> {
        self.volume = volume;
        match &self.handle {
            Some(handle) => handle.set_volume(volume).await,
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) {
        info!("mpv: shutting down");
        if let Some(handle) = self.handle.take() {
            let _ = handle.send(json!(["stop"])).await;
        }
        self.driver.kill().await;
    }
}
