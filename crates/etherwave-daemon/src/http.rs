/// HTTP command surface mirroring the TCP protocol for clients that prefer
/// plain JSON over a framed socket (curl, widgets, platform glue).
///
/// Routes
/// ──────
/// • `GET  /state`    — current state snapshot as JSON
/// • `GET  /stations` — current station list (URL overrides applied)
/// • `POST /command`  — a [`Command`] in JSON, queued to the playback core
/// • `POST /focus`    — a [`FocusChange`] in JSON; this is how session hooks
///   and udev scripts tell the daemon about focus/output changes
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use etherwave_proto::protocol::{Command, PlayerState};
use etherwave_proto::state::StateStore;
use etherwave_proto::stations::Station;

use crate::core::CoreEvent;
use crate::focus::FocusChange;
use crate::source::StationSource;

struct ApiState<S> {
    store: StateStore,
    source: Arc<S>,
    event_tx: mpsc::Sender<CoreEvent>,
}

// Manual impl: the derive would demand S: Clone, but the source is shared
// through the Arc.
impl<S> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            source: self.source.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

async fn get_state<S: StationSource>(State(api): State<ApiState<S>>) -> Json<PlayerState> {
    Json(api.store.snapshot().await)
}

async fn get_stations<S: StationSource>(
    State(api): State<ApiState<S>>,
) -> Result<Json<Vec<Station>>, StatusCode> {
    match api.source.stations().await {
        Ok(stations) => Ok(Json(stations)),
        Err(e) => {
            warn!("station snapshot failed: {:#}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn post_command<S: StationSource>(
    State(api): State<ApiState<S>>,
    Json(cmd): Json<Command>,
) -> StatusCode {
    info!("HTTP command: {:?}", cmd);
    if api.event_tx.send(CoreEvent::Command(cmd)).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn post_focus<S: StationSource>(
    State(api): State<ApiState<S>>,
    Json(change): Json<FocusChange>,
) -> StatusCode {
    info!("HTTP focus change: {:?}", change);
    if api.event_tx.send(CoreEvent::Focus(change)).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

pub fn start_server<S: StationSource>(
    bind_address: String,
    port: u16,
    store: StateStore,
    source: Arc<S>,
    event_tx: mpsc::Sender<CoreEvent>,
) -> tokio::task::JoinHandle<()> {
    let api = ApiState {
        store,
        source,
        event_tx,
    };

    let app = Router::new()
        .route("/state", get(get_state::<S>))
        .route("/stations", get(get_stations::<S>))
        .route("/command", post(post_command::<S>))
        .route("/focus", post(post_focus::<S>))
        .layer(CorsLayer::permissive())
        .with_state(api);

    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        info!("HTTP API listening on http://{}", addr);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to bind HTTP API on {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            warn!("HTTP API error: {}", e);
        }
    })
}
