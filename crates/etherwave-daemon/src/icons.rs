//! Station artwork cache.  Icons are fetched once, streamed to disk under
//! the cache directory and reused forever after; every failure degrades to
//! "no icon" rather than an error surfaced to playback.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use etherwave_proto::stations::Station;

/// Retries beyond the initial attempt.
const MAX_RETRIES: u32 = 2;
const BASE_DELAY: Duration = Duration::from_millis(1000);

pub struct IconCache {
    dir: PathBuf,
    client: Client,
}

impl IconCache {
    pub fn new(dir: PathBuf) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_default();
        Self { dir, client }
    }

    fn cache_path(&self, station_id: u32) -> PathBuf {
        self.dir.join(format!("{}.icon", station_id))
    }

    /// Returns the local path of the station's icon, downloading it on a
    /// cache miss.  None when the station has no icon URL or every download
    /// attempt failed.
    pub async fn get_icon(&self, station: &Station) -> Option<PathBuf> {
        let url = station.icon_url.as_deref()?;
        let path = self.cache_path(station.id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Some(path);
        }

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                // 1s, 2s, 4s...
                tokio::time::sleep(BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
            match self.download(url, &path).await {
                Ok(()) => {
                    debug!("cached icon for station {} at {:?}", station.id, path);
                    return Some(path);
                }
                Err(DownloadError::NotRetryable(e)) => {
                    warn!("icon fetch for station {} rejected: {}", station.id, e);
                    return None;
                }
                Err(DownloadError::Retryable(e)) => {
                    warn!(
                        "icon fetch for station {} failed (attempt {}): {}",
                        station.id,
                        attempt + 1,
                        e
                    );
                }
            }
        }
        None
    }

    async fn download(&self, url: &str, path: &Path) -> Result<(), DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            // A 404 will be a 404 tomorrow too
            return Err(DownloadError::NotRetryable(format!(
                "upstream returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(DownloadError::Retryable(format!(
                "upstream returned {}",
                status
            )));
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DownloadError::NotRetryable(e.to_string()))?;

        // Stream to a temp file first so a torn download never looks like a
        // cache hit
        let tmp = path.with_extension("icon.tmp");
        let byte_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut reader = StreamReader::new(byte_stream);
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| DownloadError::NotRetryable(e.to_string()))?;
        if let Err(e) = tokio::io::copy(&mut reader, &mut file).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DownloadError::Retryable(e.to_string()));
        }
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| DownloadError::NotRetryable(e.to_string()))?;
        Ok(())
    }
}

enum DownloadError {
    Retryable(String),
    NotRetryable(String),
}
