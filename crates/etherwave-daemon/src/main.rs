mod core;
mod engine;
mod focus;
mod http;
mod icons;
mod marker;
mod retry;
mod socket;
mod source;
mod status;
mod surface;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use etherwave_proto::config::Config;
use etherwave_proto::state::{PersistentSurfaceState, StateStore};

use crate::source::{FileStationSource, StationSource};

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only forward WARN and ERROR to clients to avoid clogging the channel
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = etherwave_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let broadcast_layer = BroadcastLayer::new(broadcast_tx.clone());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,etherwave_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let source = Arc::new(FileStationSource::new(
        config.stations.stations_toml.clone(),
        config.stations.url_overrides.clone(),
    ));

    // Restore the last station across restarts; the saved id is revalidated
    // against a fresh list and dropped if the station no longer exists.
    let stations = source.stations().await?;
    info!("Loaded {} stations", stations.len());
    let saved = PersistentSurfaceState::load(&config.daemon.surface_file);
    let initial_station = saved.revalidate(&stations).map(|(station, index)| {
        info!("Restoring station {} (index {})", station.id, index);
        station
    });

    let store = StateStore::new(initial_station);

    // Event channel — all external inputs funnel into the playback core
    let (event_tx, event_rx) = mpsc::channel::<core::CoreEvent>(256);

    // Engine callbacks arrive on their own channel and are folded into the
    // core's queue so they serialize with commands
    let (engine_tx, mut engine_rx) = mpsc::channel::<engine::EngineEvent>(64);
    let engine = engine::MpvEngine::new(engine_tx);
    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = engine_rx.recv().await {
                if event_tx.send(core::CoreEvent::Engine(ev)).await.is_err() {
                    break;
                }
            }
        });
    }

    let playback_core = core::PlaybackCore::new(
        engine,
        source.clone(),
        store.clone(),
        retry::RetryPolicy::from_config(&config.retry),
        marker::TaskMarker::new(config.daemon.marker_file.clone()),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    // Start TCP socket server
    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        etherwave_proto::platform::DAEMON_TCP_PORT,
        store.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    // Start HTTP API if enabled
    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            store.clone(),
            source.clone(),
            event_tx.clone(),
        );
    }

    // State observers: now-playing file + persisted surface snapshot
    let _status_handle = status::start_renderer(
        config.daemon.status_file.clone(),
        store.clone(),
        broadcast_tx.clone(),
    );
    let icon_cache = Arc::new(icons::IconCache::new(config.icons.cache_dir.clone()));
    let _surface_handle = surface::start_persister(
        config.daemon.surface_file.clone(),
        store.clone(),
        source.clone(),
        icon_cache,
        broadcast_tx.clone(),
    );

    info!("Daemon initialised, running event loop");
    playback_core.run(event_rx).await?;

    Ok(())
}
