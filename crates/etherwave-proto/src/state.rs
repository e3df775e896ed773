use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::protocol::{ErrorInfo, PlaybackStatus, PlayerState};
use crate::stations::Station;

/// Shared container for the published playback state.
///
/// Single-writer by contract: only the playback core calls the mutating
/// methods, always from its serialized event loop, so state changes are
/// applied in the order generated.  Every other component holds a clone and
/// reads snapshots.  Each mutation bumps `rev`.
#[derive(Clone)]
pub struct StateStore {
    state: Arc<RwLock<PlayerState>>,
}

impl StateStore {
    pub fn new(initial_station: Option<Station>) -> Self {
        let state = PlayerState {
            rev: 1,
            current_station: initial_station,
            playback_status: PlaybackStatus::Idle,
            is_playing: false,
            is_buffering: false,
            last_error: None,
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn arc(&self) -> Arc<RwLock<PlayerState>> {
        Arc::clone(&self.state)
    }

    pub async fn snapshot(&self) -> PlayerState {
        self.state.read().await.clone()
    }

    /// A new station is being loaded.  Clears any surfaced error.
    pub async fn set_connecting(&self, station: &Station) {
        let mut state = self.state.write().await;
        state.current_station = Some(station.clone());
        state.playback_status = PlaybackStatus::Connecting;
        state.is_playing = false;
        state.is_buffering = true;
        state.last_error = None;
        state.rev += 1;
    }

    /// Engine reported ready; mirror its actual paused flag.
    pub async fn set_ready(&self, engine_paused: bool) {
        let mut state = self.state.write().await;
        state.playback_status = if engine_paused {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Playing
        };
        state.is_playing = !engine_paused;
        state.is_buffering = false;
        state.last_error = None;
        state.rev += 1;
    }

    /// Buffering does not alter `is_playing` — audio may still be flowing
    /// from the existing buffer.
    pub async fn set_buffering(&self) {
        let mut state = self.state.write().await;
        state.is_buffering = true;
        state.rev += 1;
    }

    /// The stream ended.  Radio streams are not expected to end; this is a
    /// terminal no-retry condition, distinct from an error.
    pub async fn set_ended(&self) {
        let mut state = self.state.write().await;
        state.is_playing = false;
        state.is_buffering = false;
        state.playback_status = PlaybackStatus::Idle;
        state.rev += 1;
    }

    pub async fn set_error(&self, error: ErrorInfo) {
        let mut state = self.state.write().await;
        state.playback_status = PlaybackStatus::Error;
        state.is_playing = false;
        state.is_buffering = false;
        state.last_error = Some(error);
        state.rev += 1;
    }

    pub async fn set_paused(&self) {
        let mut state = self.state.write().await;
        state.playback_status = PlaybackStatus::Paused;
        state.is_playing = false;
        state.rev += 1;
    }

    pub async fn set_resumed(&self) {
        let mut state = self.state.write().await;
        state.playback_status = PlaybackStatus::Playing;
        state.is_playing = true;
        state.rev += 1;
    }

    pub async fn set_stopped(&self) {
        let mut state = self.state.write().await;
        state.current_station = None;
        state.playback_status = PlaybackStatus::Idle;
        state.is_playing = false;
        state.is_buffering = false;
        state.last_error = None;
        state.rev += 1;
    }

    /// Replaces the held station snapshot after a URL edit.  Returns false
    /// when the edited station is not the current one.
    pub async fn refresh_station(&self, station: &Station) -> bool {
        let mut state = self.state.write().await;
        match &state.current_station {
            Some(current) if current.id == station.id => {
                state.current_station = Some(station.clone());
                state.rev += 1;
                true
            }
            _ => false,
        }
    }
}

// ── persisted external-surface state ──────────────────────────────────────────

/// Minimal durable state so external surfaces survive daemon restarts.
/// Allowed to be stale: always revalidated against a fresh station snapshot
/// before use, because the station may have been removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersistentSurfaceState {
    pub is_playing: bool,
    pub current_station_id: Option<u32>,
    pub current_station_index: Option<usize>,
}

impl PersistentSurfaceState {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    pub async fn save(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Resolves the saved station id against a fresh list.  The index is
    /// recomputed, never trusted from disk.
    pub fn revalidate(&self, stations: &[Station]) -> Option<(Station, usize)> {
        let id = self.current_station_id?;
        stations
            .iter()
            .position(|s| s.id == id)
            .map(|idx| (stations[idx].clone(), idx))
    }
}
