use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub stations: StationsConfig,
    #[serde(default)]
    pub icons: IconsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Durable external-surface snapshot, revalidated on load.
    #[serde(default = "default_surface_file")]
    pub surface_file: PathBuf,
    /// Present while the daemon is doing observable playback work; always
    /// removed on the transition to Idle.
    #[serde(default = "default_marker_file")]
    pub marker_file: PathBuf,
    /// One-line now-playing summary for status bars.
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

/// Playback retry/backoff knobs.  Delay grows linearly:
/// `base_delay_ms * attempt` for the 1-indexed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Station list, `[[station]]` tables with stable integer ids.
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    /// User-edited stream URLs, kept apart from the station file.
    #[serde(default = "default_url_overrides")]
    pub url_overrides: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IconsConfig {
    #[serde(default = "default_icon_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            surface_file: default_surface_file(),
            marker_file: default_marker_file(),
            status_file: default_status_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            url_overrides: default_url_overrides(),
        }
    }
}

impl Default for IconsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_icon_cache_dir(),
        }
    }
}

fn default_surface_file() -> PathBuf {
    platform::data_dir().join("surface.json")
}

fn default_marker_file() -> PathBuf {
    platform::data_dir().join("daemon.active")
}

fn default_status_file() -> PathBuf {
    platform::data_dir().join("now_playing")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8870
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_stations_toml() -> PathBuf {
    platform::config_dir().join("stations.toml")
}

fn default_url_overrides() -> PathBuf {
    platform::data_dir().join("url_overrides.json")
}

fn default_icon_cache_dir() -> PathBuf {
    platform::cache_dir().join("icons")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8870);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.stations.stations_toml.ends_with("etherwave/stations.toml"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str("[retry]\nmax_retries = 5\n").unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert!(config.http.enabled);
    }
}
