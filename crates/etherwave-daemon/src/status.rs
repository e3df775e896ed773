//! Now-playing status renderer: mirrors every state revision into a small
//! plain-text file that status bars (waybar, polybar, ...) can poll.

use std::path::PathBuf;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use etherwave_proto::protocol::{ErrorKind, PlaybackStatus, PlayerState};
use etherwave_proto::state::StateStore;

use crate::BroadcastMessage;

/// One line, no trailing newline handling required of consumers.
pub fn render_status_line(state: &PlayerState) -> String {
    let station = state
        .current_station
        .as_ref()
        .map(|s| s.name.as_str())
        .unwrap_or("—");
    match state.playback_status {
        PlaybackStatus::Idle => "stopped".to_string(),
        PlaybackStatus::Connecting => format!("connecting: {}", station),
        PlaybackStatus::Playing => {
            if state.is_buffering {
                format!("buffering: {}", station)
            } else {
                format!("playing: {}", station)
            }
        }
        PlaybackStatus::Paused => format!("paused: {}", station),
        PlaybackStatus::Error => {
            let reason = match state.last_error.as_ref().map(|e| e.kind) {
                Some(ErrorKind::Network) => "network error",
                Some(ErrorKind::Format) => "unsupported stream",
                _ => "error",
            };
            format!("{}: {}", reason, station)
        }
    }
}

async fn write_atomic(path: &PathBuf, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

pub fn start_renderer(
    path: PathBuf,
    store: StateStore,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = broadcast_tx.subscribe();
    tokio::spawn(async move {
        // Seed the file so consumers never see a stale line from a previous run
        let initial = render_status_line(&store.snapshot().await);
        if let Err(e) = write_atomic(&path, &format!("{}\n", initial)).await {
            warn!("failed to write status file {:?}: {}", path, e);
        }

        loop {
            match rx.recv().await {
                Ok(BroadcastMessage::StateUpdated)
                | Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Lagging is fine: we always render the latest snapshot
                    let line = render_status_line(&store.snapshot().await);
                    debug!("status: {}", line);
                    if let Err(e) = write_atomic(&path, &format!("{}\n", line)).await {
                        warn!("failed to write status file {:?}: {}", path, e);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherwave_proto::protocol::ErrorInfo;
    use etherwave_proto::stations::Station;

    fn station() -> Station {
        Station {
            id: 7,
            name: "Deep North".to_string(),
            stream_url: "https://stream.example.org/deepnorth".to_string(),
            icon_url: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn renders_lifecycle_lines() {
        let store = StateStore::new(None);
        assert_eq!(render_status_line(&store.snapshot().await), "stopped");

        store.set_connecting(&station()).await;
        assert_eq!(
            render_status_line(&store.snapshot().await),
            "connecting: Deep North"
        );

        store.set_ready(false).await;
        assert_eq!(
            render_status_line(&store.snapshot().await),
            "playing: Deep North"
        );

        store.set_paused().await;
        assert_eq!(
            render_status_line(&store.snapshot().await),
            "paused: Deep North"
        );
    }

    #[tokio::test]
    async fn renders_error_kind() {
        let store = StateStore::new(Some(station()));
        store
            .set_error(ErrorInfo {
                kind: ErrorKind::Network,
                station_id: 7,
                station_name: "Deep North".to_string(),
                message: "connection refused".to_string(),
            })
            .await;
        assert_eq!(
            render_status_line(&store.snapshot().await),
            "network error: Deep North"
        );
    }

    #[tokio::test]
    async fn writes_file_on_state_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("now_playing");
        let store = StateStore::new(None);
        let (tx, _) = broadcast::channel(16);

        let handle = start_renderer(path.clone(), store.clone(), tx.clone());
        tokio::task::yield_now().await;

        store.set_connecting(&station()).await;
        tx.send(BroadcastMessage::StateUpdated).unwrap();

        // Give the renderer a moment to pick the message up
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                if content.trim() == "connecting: Deep North" {
                    handle.abort();
                    return;
                }
            }
        }
        panic!("status file never reached expected content");
    }
}
