use std::future::Future;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::warn;

use etherwave_proto::stations::{parse_stations_from_toml_str, Station, UrlOverrides};

/// Asynchronous snapshot access to the ordered station list.  A snapshot is
/// a one-time read: ids are stable, order is meaningful for next/previous,
/// and there is no live subscription.  Failures surface as errors the caller
/// treats as a no-op, never a crash.
pub trait StationSource: Send + Sync + 'static {
    fn stations(&self) -> impl Future<Output = anyhow::Result<Vec<Station>>> + Send;

    /// Persist a user-edited stream URL.  Returns the refreshed station, or
    /// None when the id is unknown.
    fn update_url(
        &self,
        station_id: u32,
        url: &str,
    ) -> impl Future<Output = anyhow::Result<Option<Station>>> + Send;

    /// Drop the override, restoring the configured URL exactly.
    fn reset_url(
        &self,
        station_id: u32,
    ) -> impl Future<Output = anyhow::Result<Option<Station>>> + Send;
}

/// File-backed station source: `stations.toml` plus a persisted URL-override
/// map applied on every snapshot.
pub struct FileStationSource {
    stations_path: PathBuf,
    overrides: Mutex<UrlOverrides>,
}

impl FileStationSource {
    pub fn new(stations_path: PathBuf, overrides_path: PathBuf) -> Self {
        Self {
            stations_path,
            overrides: Mutex::new(UrlOverrides::load(overrides_path)),
        }
    }

    async fn load_raw(&self) -> anyhow::Result<Vec<Station>> {
        let content = match tokio::fs::read_to_string(&self.stations_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("station file {:?} not found", self.stations_path);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        parse_stations_from_toml_str(&content)
    }

    async fn find(&self, station_id: u32) -> anyhow::Result<Option<Station>> {
        Ok(self
            .stations()
            .await?
            .into_iter()
            .find(|s| s.id == station_id))
    }
}

impl StationSource for FileStationSource {
    async fn stations(&self) -> anyhow::Result<Vec<Station>> {
        let mut stations = self.load_raw().await?;
        self.overrides.lock().await.apply(&mut stations);
        Ok(stations)
    }

    async fn update_url(&self, station_id: u32, url: &str) -> anyhow::Result<Option<Station>> {
        {
            let mut overrides = self.overrides.lock().await;
            overrides.set(station_id, url.to_string())?;
        }
        self.find(station_id).await
    }

    async fn reset_url(&self, station_id: u32) -> anyhow::Result<Option<Station>> {
        {
            let mut overrides = self.overrides.lock().await;
            overrides.remove(station_id)?;
        }
        self.find(station_id).await
    }
}
