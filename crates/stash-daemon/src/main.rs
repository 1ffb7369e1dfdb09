mod core;
mod http;
mod mpv;
mod remote;
mod search;
mod sink;
mod socket;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use stash_proto::config::Config;
use stash_proto::persistence::LocalStore;
use stash_proto::playback::{PlaybackPreferences, PlaybackSession};
use stash_proto::state::{AppState, StateManager, StoreEvent};
use stash_proto::stations::{load_seed, ANONYMOUS};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Forwards WARN and ERROR events to connected clients as
/// `StoreEvent::Log`.
struct BroadcastLayer {
    sender: broadcast::Sender<StoreEvent>,
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut MessageVisitor(&mut message));

        // no receivers is fine
        let _ = self.sender.send(StoreEvent::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        use std::fmt::Write;
        if field.name() == "message" {
            let _ = write!(self.0, "{:?}", value);
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // created first so the log layer can publish into the store channel
    let (events_tx, _) = broadcast::channel::<StoreEvent>(256);

    let config = Config::load()?;

    let data_dir = config.daemon.data_dir.clone();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("stashd.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(BroadcastLayer {
            sender: events_tx.clone(),
        })
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stash_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);
    info!("Config loaded from: {:?}", Config::config_path());

    // Initial state: anonymous list plus saved volume / mute
    let store = LocalStore::new(&data_dir);
    let seed = load_seed(&config.stations.seed_toml);
    let prefs = store
        .load_preferences_or(PlaybackPreferences {
            volume: config.playback.default_volume,
            is_muted: false,
        })
        .await;
    let collection = store.load_collection(ANONYMOUS, &seed).await;
    let playback = PlaybackSession::with_preferences(prefs.volume, prefs.is_muted);
    let initial_volume = playback.effective_volume();

    let state_manager = Arc::new(StateManager::with_publisher(
        AppState::new(collection, playback),
        events_tx,
    ));

    let remote = remote::from_config(&config.remote);

    sync::PersistenceWorker::new(
        state_manager.clone(),
        store.clone(),
        remote.clone(),
        Duration::from_millis(config.remote.debounce_ms),
        prefs,
    )
    .spawn();

    // Event channel: every external input funnels into StashCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::CoreEvent>(256);
    let sink = mpv::MpvSink::new(event_tx.clone(), initial_volume);
    let stash_core = core::StashCore::new(
        state_manager.clone(),
        sink,
        store,
        remote,
        seed,
        event_tx.clone(),
    );
    let handle = core::CoreHandle::new(event_tx.clone());

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        stash_proto::platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        handle.clone(),
    );

    if config.http.enabled {
        let search = match search::StationSearch::new(&config.search) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                warn!("Station search unavailable: {}", e);
                None
            }
        };
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                state_manager: state_manager.clone(),
                core: handle,
                search,
            },
        );
    }

    let shutdown_tx = event_tx;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(core::CoreEvent::Shutdown).await;
        }
    });

    info!("stashd initialised, running event loop");
    stash_core.run(event_rx).await?;

    Ok(())
}
