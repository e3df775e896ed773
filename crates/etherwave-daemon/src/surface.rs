//! External-surface persister: keeps `surface.json` in sync with the
//! published state so widgets and the daemon itself can restore their view
//! after a restart.  Also warms the icon cache for the current station so a
//! surface drawn right after restart has artwork available offline.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use etherwave_proto::state::{PersistentSurfaceState, StateStore};

use crate::icons::IconCache;
use crate::source::StationSource;
use crate::BroadcastMessage;

pub fn start_persister<S: StationSource>(
    path: PathBuf,
    store: StateStore,
    source: Arc<S>,
    icons: Arc<IconCache>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = broadcast_tx.subscribe();
    tokio::spawn(async move {
        let mut last_written: Option<PersistentSurfaceState> = None;

        loop {
            match rx.recv().await {
                Ok(BroadcastMessage::StateUpdated)
                | Err(broadcast::error::RecvError::Lagged(_)) => {
                    let snapshot = store.snapshot().await;
                    let station = snapshot.current_station;

                    // The index is derived at write time; consumers must
                    // revalidate it on load anyway.
                    let index = match (&station, source.stations().await) {
                        (Some(current), Ok(stations)) => {
                            stations.iter().position(|s| s.id == current.id)
                        }
                        (_, Err(e)) => {
                            warn!("station snapshot failed while persisting: {:#}", e);
                            None
                        }
                        _ => None,
                    };

                    let surface = PersistentSurfaceState {
                        is_playing: snapshot.is_playing,
                        current_station_id: station.as_ref().map(|s| s.id),
                        current_station_index: index,
                    };

                    if last_written.as_ref() == Some(&surface) {
                        continue;
                    }
                    debug!("persisting surface state: {:?}", surface);
                    if let Err(e) = surface.save(&path).await {
                        warn!("failed to persist surface state to {:?}: {:#}", path, e);
                    }
                    last_written = Some(surface);

                    if let Some(station) = station {
                        // Best-effort warm-up; a miss just means no artwork
                        let _ = icons.get_icon(&station).await;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
