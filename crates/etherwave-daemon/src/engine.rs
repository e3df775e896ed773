//! mpv IPC engine driver with separated reader/writer tasks.
//!
//! ```text
//!   MpvEngine::load()
//!         │ (spawns mpv on first use, reconnects after death)
//!         ├── writer_task   ← receives requests via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot
//!                                └── event / property-change   → EventMapper
//!                                                                     │
//!                                                  EngineEvent → playback core
//! ```
//!
//! The playback core never sees raw mpv traffic: the mapper reduces it to the
//! four callbacks the state machine consumes (`Ready`, `Buffering`, `Ended`,
//! `Failed`).  No other component may talk to the engine directly.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

// ── engine-facing vocabulary ──────────────────────────────────────────────────

/// Failure taxonomy at the engine boundary.  Mapped onto `ErrorKind` by the
/// playback core's classification step.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),
    #[error("stream format error: {0}")]
    Format(String),
    #[error("{0}")]
    Other(String),
}

/// Engine callbacks, delivered as messages on the core's event queue so no
/// handler ever runs re-entrantly inside an IPC read.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Stream is loaded and decodable; `paused` mirrors the engine's actual
    /// pause flag.
    Ready { paused: bool },
    Buffering,
    /// Stream ended cleanly.  Not an error and never retried.
    Ended,
    Failed(EngineError),
}

/// The engine operations the playback core drives.  Behind a trait so core
/// tests run against a scripted fake instead of a live mpv process.
pub trait AudioEngine: Send + Sync + 'static {
    fn load(&self, url: &str) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
    fn set_paused(&self, paused: bool)
        -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
    fn stop(&self) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Sorts an engine failure description into the retryable taxonomy.  mpv
/// reports load failures as free text (`file_error` / log lines), so this is
/// substring matching on the usual suspects.
pub fn classify_failure(text: &str) -> EngineError {
    let lower = text.to_ascii_lowercase();
    const NETWORK: &[&str] = &[
        "network",
        "timed out",
        "timeout",
        "unreachable",
        "connection",
        "refused",
        "resolving",
        "resolve",
        "tls",
    ];
    const FORMAT: &[&str] = &[
        "format",
        "demux",
        "parse",
        "parsing",
        "unrecognized",
        "unsupported",
        "invalid data",
        "corrupt",
    ];
    if NETWORK.iter().any(|needle| lower.contains(needle)) {
        EngineError::Network(text.to_string())
    } else if FORMAT.iter().any(|needle| lower.contains(needle)) {
        EngineError::Format(text.to_string())
    } else {
        EngineError::Other(text.to_string())
    }
}

// ── raw mpv event → EngineEvent mapping ───────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
const OBS_PAUSE: u64 = 1;
const OBS_CORE_IDLE: u64 = 2;
const OBS_PAUSED_FOR_CACHE: u64 = 3;

/// Reduces the raw mpv event stream to `EngineEvent`s.  Tracks just enough
/// state (file loaded, last pause flag) to suppress property noise while no
/// stream is loaded.
#[derive(Debug, Default)]
struct EventMapper {
    loaded: bool,
    paused: bool,
}

impl EventMapper {
    fn map(&mut self, raw: &Value) -> Option<EngineEvent> {
        if let Some(event) = raw.get("event").and_then(Value::as_str) {
            match event {
                "file-loaded" => {
                    self.loaded = true;
                    return Some(EngineEvent::Ready {
                        paused: self.paused,
                    });
                }
                "end-file" => {
                    let was_loaded = self.loaded;
                    self.loaded = false;
                    let reason = raw.get("reason").and_then(Value::as_str).unwrap_or("");
                    return match reason {
                        "eof" => Some(EngineEvent::Ended),
                        "error" => {
                            let detail = raw
                                .get("file_error")
                                .and_then(Value::as_str)
                                .unwrap_or("stream playback failed");
                            Some(EngineEvent::Failed(classify_failure(detail)))
                        }
                        // "stop" / "redirect" / replaced by a new loadfile —
                        // the core already knows.
                        _ => {
                            let _ = was_loaded;
                            None
                        }
                    };
                }
                "property-change" => {
                    let id = raw.get("id").and_then(Value::as_u64)?;
                    let data = raw.get("data");
                    return self.map_property(id, data);
                }
                _ => return None,
            }
        }
        None
    }

    fn map_property(&mut self, id: u64, data: Option<&Value>) -> Option<EngineEvent> {
        match id {
            OBS_PAUSE => {
                let paused = data.and_then(Value::as_bool)?;
                self.paused = paused;
                if self.loaded {
                    Some(EngineEvent::Ready { paused })
                } else {
                    None
                }
            }
            OBS_CORE_IDLE => {
                let idle = data.and_then(Value::as_bool)?;
                if !idle && self.loaded {
                    Some(EngineEvent::Ready {
                        paused: self.paused,
                    })
                } else {
                    None
                }
            }
            OBS_PAUSED_FOR_CACHE => {
                let stalled = data.and_then(Value::as_bool)?;
                if !self.loaded {
                    None
                } else if stalled {
                    Some(EngineEvent::Buffering)
                } else {
                    Some(EngineEvent::Ready {
                        paused: self.paused,
                    })
                }
            }
            _ => None,
        }
    }
}

// ── IPC plumbing ──────────────────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Cloneable handle to the mpv writer task.  `send()` fires a command and
/// awaits the response.
#[derive(Clone)]
struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("engine writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("engine IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("engine reply channel dropped req={}", req_id))?
    }

    async fn observe_properties(&self) {
        let props = [
            (OBS_PAUSE, "pause"),
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("engine: observe_property id={} name={}", id, name),
                Err(e) => warn!("engine: observe_property {} failed: {}", name, e),
            }
        }
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
    raw_tx: mpsc::Sender<Value>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("engine reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("engine IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("engine reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(Value::as_u64) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            Err(anyhow::anyhow!("engine error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("engine reader: response for unknown req={}", req_id);
                    }
                } else {
                    // Unsolicited event / property-change
                    let _ = raw_tx.send(val).await;
                }
            }
            Err(e) => {
                warn!("engine reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("engine IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register the reply channel before writing so the reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("engine writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("engine write error: {}", e)));
            }
            break;
        }
    }
    debug!("engine writer: task exiting");
}

// ── process supervision ───────────────────────────────────────────────────────

struct MpvInner {
    process: Option<tokio::process::Child>,
    handle: Option<MpvHandle>,
}

impl MpvInner {
    fn process_alive(&mut self) -> bool {
        match self.process {
            Some(ref mut child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }
}

/// Owns the mpv child process and (re)connects its IPC socket.  Spawned
/// lazily on the first `load`; a dead process is replaced on the next one,
/// so an engine crash surfaces as a normal retryable failure rather than a
/// daemon restart.
pub struct MpvEngine {
    inner: Mutex<MpvInner>,
    raw_tx: mpsc::Sender<Value>,
}

impl MpvEngine {
    /// Builds the engine and starts the mapper task that feeds
    /// `EngineEvent`s into `event_tx`.
    pub fn new(event_tx: mpsc::Sender<EngineEvent>) -> Arc<Self> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<Value>(128);
        tokio::spawn(async move {
            let mut mapper = EventMapper::default();
            while let Some(raw) = raw_rx.recv().await {
                if let Some(event) = mapper.map(&raw) {
                    debug!("engine event: {:?}", event);
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        Arc::new(Self {
            inner: Mutex::new(MpvInner {
                process: None,
                handle: None,
            }),
            raw_tx,
        })
    }

    #[cfg(unix)]
    async fn ensure_connected(&self, inner: &mut MpvInner) -> anyhow::Result<MpvHandle> {
        if inner.process_alive() {
            if let Some(handle) = &inner.handle {
                return Ok(handle.clone());
            }
        }

        // Kill any stale process before respawning
        if let Some(mut p) = inner.process.take() {
            let _ = p.kill().await;
        }
        inner.handle = None;

        let socket_path = etherwave_proto::platform::engine_socket_path();
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("engine: spawning new mpv process");
        let binary = etherwave_proto::platform::find_engine_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found on PATH"))?;

        let child = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(etherwave_proto::platform::engine_socket_arg())
            .arg("--quiet")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        inner.process = Some(child);

        // Wait for the IPC socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("engine IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("engine: connected to IPC socket");

        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::new(read_half);

        // pending map: req_id → reply channel, shared between writer
        // (inserts) and reader (resolves).
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

        tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(reader, pending, self.raw_tx.clone()));

        let handle = MpvHandle { tx: cmd_tx };
        handle.observe_properties().await;
        inner.handle = Some(handle.clone());
        Ok(handle)
    }
}

impl AudioEngine for Arc<MpvEngine> {
    async fn load(&self, url: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let handle = self.ensure_connected(&mut inner).await?;
        handle.send(json!(["loadfile", url])).await?;
        handle.send(json!(["set_property", "pause", false])).await?;
        Ok(())
    }

    async fn set_paused(&self, paused: bool) -> anyhow::Result<()> {
        let inner = self.inner.lock().await;
        let handle = inner
            .handle
            .clone()
            .ok_or_else(|| anyhow::anyhow!("engine not running"))?;
        drop(inner);
        handle.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let inner = self.inner.lock().await;
        let handle = match inner.handle.clone() {
            Some(h) => h,
            None => return Ok(()), // nothing loaded, nothing to stop
        };
        drop(inner);
        let _ = handle.send(json!(["stop"])).await;
        Ok(())
    }
}
