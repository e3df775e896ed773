use serde::{Deserialize, Serialize};

use crate::stations::Station;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check it on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands accepted by the daemon, from any trigger: connected clients,
/// hardware media keys forwarded by the desktop, status-bar buttons, or
/// external-surface taps.  Every one is an idempotent no-op when playback is
/// already in the target state, so duplicate or out-of-order delivery is safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// With a payload: switch to that station.  Without: resume the current one.
    Play {
        #[serde(default)]
        station: Option<Station>,
    },
    Pause,
    Stop,
    Next,
    Previous,
    /// Persist a user-edited stream URL for a station.
    UpdateStationUrl { station_id: u32, url: String },
    /// Drop the saved URL override, restoring the configured URL, and
    /// re-attempt playback if the station is the current one.
    ResetStationUrl { station_id: u32 },
    GetState,
}

/// Messages pushed from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        state: PlayerState,
    },
    State {
        data: PlayerState,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Playback lifecycle states.
///
/// ```text
///   Idle → Connecting → Playing ⇄ Paused
///   Connecting | Playing | Paused → Error     (engine failure)
///   Error → Connecting                         (automatic retry)
///   Error → Idle                               (explicit stop)
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    /// Load issued, engine buffering/connecting.
    Connecting,
    Playing,
    Paused,
    /// Engine failure; retries may be pending or exhausted.
    Error,
}

/// Coarse failure classes.  Classification happens exactly once, at the
/// playback core's engine boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Format,
    Unknown,
}

/// The most recent unresolved playback failure.  Cleared on the next
/// successful ready callback or when a new station is played.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub station_id: u32,
    pub station_name: String,
    pub message: String,
}

/// Full published playback state.  `rev` is a monotonically increasing
/// counter incremented on every change; lagged observers use it to detect
/// missed updates and resync from a fresh snapshot.
///
/// Single-writer: only the playback core mutates this (via the state store);
/// everyone else reads snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayerState {
    #[serde(default)]
    pub rev: u64,
    pub current_station: Option<Station>,
    pub playback_status: PlaybackStatus,
    /// True only while audio is actually flowing.  Implies `current_station`
    /// is set.
    pub is_playing: bool,
    pub is_buffering: bool,
    #[serde(default)]
    pub last_error: Option<ErrorInfo>,
}

/// Wrapper for socket communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
