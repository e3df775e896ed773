use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A named network audio stream endpoint.  `id` is the stable identity:
/// list positions change across sync cycles, ids never do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Station {
    pub id: u32,
    pub name: String,
    pub stream_url: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    /// Free-form extras (genre, language, region, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[station]]` table.
/// Kept separate from `Station` so the file schema can diverge from the wire
/// struct without breaking either.
#[derive(Debug, Deserialize)]
struct TomlStationFile {
    station: Vec<TomlStation>,
}

#[derive(Debug, Deserialize)]
struct TomlStation {
    id: u32,
    name: String,
    url: String,
    #[serde(default)]
    icon_url: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let mut seen = std::collections::BTreeSet::new();
    let mut stations = Vec::with_capacity(file.station.len());
    for s in file.station {
        if !seen.insert(s.id) {
            anyhow::bail!("duplicate station id {} in station file", s.id);
        }
        stations.push(Station {
            id: s.id,
            name: s.name,
            stream_url: s.url,
            icon_url: s.icon_url,
            metadata: s.metadata,
        });
    }
    Ok(stations)
}

pub fn load_stations_from_toml(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

// ── URL overrides ─────────────────────────────────────────────────────────────

/// User-edited stream URLs, persisted separately from the station file so a
/// sync cycle never clobbers them and a reset restores the file URL exactly.
#[derive(Debug)]
pub struct UrlOverrides {
    path: PathBuf,
    map: BTreeMap<u32, String>,
}

impl UrlOverrides {
    pub fn load(path: PathBuf) -> Self {
        let map = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self { path, map }
    }

    pub fn get(&self, station_id: u32) -> Option<&str> {
        self.map.get(&station_id).map(String::as_str)
    }

    pub fn set(&mut self, station_id: u32, url: String) -> anyhow::Result<()> {
        self.map.insert(station_id, url);
        self.save()
    }

    /// Removes the override.  Returns true when one existed.
    pub fn remove(&mut self, station_id: u32) -> anyhow::Result<bool> {
        let removed = self.map.remove(&station_id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Rewrites each station's URL with its saved override, if any.
    pub fn apply(&self, stations: &mut [Station]) {
        for station in stations.iter_mut() {
            if let Some(url) = self.map.get(&station.id) {
                station.stream_url = url.clone();
            }
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.map)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
