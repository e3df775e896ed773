//! The playback core: a single-threaded actor that exclusively owns the
//! playback state and the engine/focus handles.
//!
//! Every external input — client commands, engine callbacks, focus changes,
//! retry-timer firings — arrives as a [`CoreEvent`] on one mpsc queue and is
//! handled to completion before the next, which is what preserves the
//! single-writer invariant on [`StateStore`] and keeps updates ordered.
//! Nothing here is re-entrant: engine callbacks are messages, not calls.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use etherwave_proto::protocol::{Command, ErrorInfo, ErrorKind, PlaybackStatus};
use etherwave_proto::state::StateStore;
use etherwave_proto::stations::Station;

use crate::engine::{classify_failure, AudioEngine, EngineError, EngineEvent};
use crate::focus::{FocusAction, FocusArbiter, FocusChange};
use crate::marker::TaskMarker;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::source::StationSource;
use crate::BroadcastMessage;

/// Everything that can happen to the playback core.
#[derive(Debug)]
pub enum CoreEvent {
    Command(Command),
    Engine(EngineEvent),
    Focus(FocusChange),
    /// A backoff timer elapsed.  Carries the generation it was scheduled
    /// under; a bumped generation means it was cancelled in the meantime.
    RetryFire { station_id: u32, generation: u64 },
    ClientConnected,
}

/// Pending-retry bookkeeping for one station.  Destroyed on success, on
/// exhaustion, and whenever an explicit command targets a different station,
/// so a retry can never race with intentional user action.
#[derive(Debug)]
struct RetryContext {
    station_id: u32,
    attempt: u32,
}

pub struct PlaybackCore<E, S> {
    engine: E,
    source: Arc<S>,
    store: StateStore,
    focus: FocusArbiter,
    retry_policy: RetryPolicy,
    retry: Option<RetryContext>,
    /// Bumped by every explicit command; in-flight timers carry the value
    /// they were scheduled under and are discarded on mismatch.
    retry_generation: u64,
    marker: TaskMarker,
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl<E, S> PlaybackCore<E, S>
where
    E: AudioEngine,
    S: StationSource,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: E,
        source: Arc<S>,
        store: StateStore,
        retry_policy: RetryPolicy,
        marker: TaskMarker,
        event_tx: mpsc::Sender<CoreEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self {
            engine,
            source,
            store,
            focus: FocusArbiter::new(),
            retry_policy,
            retry: None,
            retry_generation: 0,
            marker,
            event_tx,
            broadcast_tx,
        }
    }

    pub fn store(&self) -> StateStore {
        self.store.clone()
    }

    /// Consumes events until every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("playback core running");
        while let Some(event) = event_rx.recv().await {
            self.handle(event).await;
        }
        info!("playback core shutting down");
        Ok(())
    }

    async fn handle(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Command(cmd) => self.handle_command(cmd).await,
            CoreEvent::Engine(ev) => self.handle_engine_event(ev).await,
            CoreEvent::Focus(change) => self.handle_focus_change(change).await,
            CoreEvent::RetryFire {
                station_id,
                generation,
            } => self.handle_retry_fire(station_id, generation).await,
            CoreEvent::ClientConnected => {
                debug!("client connected");
                self.broadcast_state();
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        debug!("command: {:?}", cmd);
        match cmd {
            Command::Play {
                station: Some(station),
            } => self.play_station(station).await,
            Command::Play { station: None } => self.resume().await,
            Command::Pause => self.pause().await,
            Command::Stop => self.stop().await,
            Command::Next => self.step_station(true).await,
            Command::Previous => self.step_station(false).await,
            Command::UpdateStationUrl { station_id, url } => {
                self.update_station_url(station_id, &url).await
            }
            Command::ResetStationUrl { station_id } => self.reset_station_url(station_id).await,
            // Served directly by the command surfaces from the state store.
            Command::GetState => {}
        }
    }

    // ── playback operations ───────────────────────────────────────────────────

    async fn play_station(&mut self, station: Station) {
        if station.stream_url.trim().is_empty() {
            warn!("refusing to play station {}: empty stream URL", station.id);
            return;
        }
        self.cancel_pending_retry(Some(station.id));
        self.start_playback(station).await;
    }

    /// Shared by explicit play and retry firing.  Does not touch the retry
    /// context: explicit paths reset it beforehand, the retry path must keep
    /// its attempt count.
    async fn start_playback(&mut self, station: Station) {
        self.marker.acquire();
        if !self.focus.request() {
            // Policy choice: a denied focus request does not block playback;
            // the platform arbiter may still duck us.
            info!("audio focus denied for station {}; continuing", station.id);
        }
        self.store.set_connecting(&station).await;
        self.broadcast_state();

        info!("loading station {} ({})", station.id, station.name);
        if let Err(e) = self.engine.load(&station.stream_url).await {
            self.handle_engine_failure(classify_failure(&e.to_string()))
                .await;
        }
    }

    async fn pause(&mut self) {
        let snapshot = self.store.snapshot().await;
        if snapshot.current_station.is_none() {
            return;
        }
        match snapshot.playback_status {
            PlaybackStatus::Playing | PlaybackStatus::Connecting => {}
            // Already paused (or nothing to pause): idempotent no-op,
            // no duplicate broadcast.
            _ => return,
        }
        self.cancel_pending_retry(None);
        self.focus.abandon();
        if let Err(e) = self.engine.set_paused(true).await {
            warn!("engine pause failed: {:#}", e);
        }
        self.store.set_paused().await;
        self.broadcast_state();
    }

    async fn resume(&mut self) {
        let snapshot = self.store.snapshot().await;
        let Some(station) = snapshot.current_station else {
            return;
        };
        match snapshot.playback_status {
            PlaybackStatus::Playing | PlaybackStatus::Connecting => {} // no-op
            PlaybackStatus::Paused => {
                self.cancel_pending_retry(Some(station.id));
                self.focus.request();
                if let Err(e) = self.engine.set_paused(false).await {
                    warn!("engine resume failed: {:#}", e);
                }
                self.store.set_resumed().await;
                self.broadcast_state();
            }
            // Stream errored out or ended: resuming means reconnecting.
            PlaybackStatus::Error | PlaybackStatus::Idle => {
                self.play_station(station).await;
            }
        }
    }

    async fn stop(&mut self) {
        let snapshot = self.store.snapshot().await;
        if snapshot.playback_status == PlaybackStatus::Idle
            && snapshot.current_station.is_none()
            && !self.marker.is_active()
        {
            return;
        }
        self.cancel_pending_retry(None);
        self.retry = None;
        self.focus.abandon();
        if let Err(e) = self.engine.stop().await {
            warn!("engine stop failed: {:#}", e);
        }
        self.store.set_stopped().await;
        self.marker.release();
        self.broadcast_state();
    }

    /// Next/previous station with wraparound.  The current station is
    /// located by id, never by remembered position: the list may have been
    /// resynced since we started playing.
    async fn step_station(&mut self, forward: bool) {
        let stations = match self.source.stations().await {
            Ok(stations) => stations,
            Err(e) => {
                warn!("station snapshot failed: {:#}", e);
                return;
            }
        };
        if stations.is_empty() {
            return;
        }
        let len = stations.len();
        let current_id = self
            .store
            .snapshot()
            .await
            .current_station
            .map(|s| s.id);
        let index = current_id.and_then(|id| stations.iter().position(|s| s.id == id));
        let target = match (index, forward) {
            (Some(i), true) => (i + 1) % len,
            (Some(i), false) => (i + len - 1) % len,
            (None, true) => 0,
            (None, false) => len - 1,
        };
        self.play_station(stations[target].clone()).await;
    }

    async fn update_station_url(&mut self, station_id: u32, url: &str) {
        match self.source.update_url(station_id, url).await {
            Ok(Some(updated)) => {
                if self.store.refresh_station(&updated).await {
                    self.broadcast_state();
                }
            }
            Ok(None) => warn!("update_station_url: unknown station {}", station_id),
            Err(e) => warn!("update_station_url failed: {:#}", e),
        }
    }

    /// Restoring the configured URL is a user-facing recovery action: when
    /// it targets the current station the error is cleared and playback is
    /// re-attempted through the normal play path.
    async fn reset_station_url(&mut self, station_id: u32) {
        match self.source.reset_url(station_id).await {
            Ok(Some(restored)) => {
                let is_current = self
                    .store
                    .snapshot()
                    .await
                    .current_station
                    .map(|s| s.id == station_id)
                    .unwrap_or(false);
                if is_current {
                    self.play_station(restored).await;
                }
            }
            Ok(None) => warn!("reset_station_url: unknown station {}", station_id),
            Err(e) => warn!("reset_station_url failed: {:#}", e),
        }
    }

    // ── engine callbacks ──────────────────────────────────────────────────────

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        if self.store.snapshot().await.current_station.is_none() {
            // Stale callback from before a stop; the engine was already told
            // to shut up.
            debug!("ignoring engine event with no current station: {:?}", event);
            return;
        }
        match event {
            EngineEvent::Ready { paused } => {
                self.store.set_ready(paused).await;
                // Successful recovery: attempt counter goes back to zero.
                self.retry = None;
                self.broadcast_state();
            }
            EngineEvent::Buffering => {
                self.store.set_buffering().await;
                self.broadcast_state();
            }
            EngineEvent::Ended => {
                info!("stream ended");
                self.store.set_ended().await;
                self.retry = None;
                self.marker.release();
                self.broadcast_state();
            }
            EngineEvent::Failed(error) => self.handle_engine_failure(error).await,
        }
    }

    async fn handle_engine_failure(&mut self, error: EngineError) {
        let snapshot = self.store.snapshot().await;
        let Some(station) = snapshot.current_station else {
            return;
        };
        let kind = match &error {
            EngineError::Network(_) => ErrorKind::Network,
            EngineError::Format(_) => ErrorKind::Format,
            EngineError::Other(_) => ErrorKind::Unknown,
        };
        warn!("playback failed for station {}: {}", station.id, error);
        self.store
            .set_error(ErrorInfo {
                kind,
                station_id: station.id,
                station_name: station.name.clone(),
                message: error.to_string(),
            })
            .await;
        self.broadcast_state();

        let attempt = match &self.retry {
            Some(ctx) if ctx.station_id == station.id => ctx.attempt + 1,
            _ => 1,
        };
        match self.retry_policy.decide(attempt) {
            RetryDecision::Retry { delay } => {
                info!(
                    "scheduling retry {} for station {} in {:?}",
                    attempt, station.id, delay
                );
                self.retry = Some(RetryContext {
                    station_id: station.id,
                    attempt,
                });
                let generation = self.retry_generation;
                let station_id = station.id;
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx
                        .send(CoreEvent::RetryFire {
                            station_id,
                            generation,
                        })
                        .await;
                });
            }
            RetryDecision::GiveUp => {
                warn!(
                    "giving up on station {} after {} attempts; waiting for user action",
                    station.id,
                    attempt - 1
                );
                self.retry = None;
            }
        }
    }

    async fn handle_retry_fire(&mut self, station_id: u32, generation: u64) {
        if generation != self.retry_generation {
            debug!("discarding cancelled retry for station {}", station_id);
            return;
        }
        // Defense-in-depth: even with a live generation, never retry a
        // station the user has navigated away from.
        let Some(current) = self.store.snapshot().await.current_station else {
            return;
        };
        if current.id != station_id {
            debug!(
                "discarding stale retry for station {} (current is {})",
                station_id, current.id
            );
            return;
        }
        info!("retrying station {}", station_id);
        self.start_playback(current).await;
    }

    // ── focus arbitration ─────────────────────────────────────────────────────

    async fn handle_focus_change(&mut self, change: FocusChange) {
        let snapshot = self.store.snapshot().await;
        match self.focus.on_change(change, snapshot.is_playing) {
            FocusAction::Pause => {
                // Focus-driven pause keeps the arbiter's flags intact; only
                // a manual pause abandons focus.
                if let Err(e) = self.engine.set_paused(true).await {
                    warn!("engine pause (focus) failed: {:#}", e);
                }
                self.store.set_paused().await;
                self.broadcast_state();
            }
            FocusAction::Resume => {
                let snapshot = self.store.snapshot().await;
                if snapshot.current_station.is_some()
                    && snapshot.playback_status == PlaybackStatus::Paused
                {
                    if let Err(e) = self.engine.set_paused(false).await {
                        warn!("engine resume (focus) failed: {:#}", e);
                    }
                    self.store.set_resumed().await;
                    self.broadcast_state();
                }
            }
            FocusAction::None => {}
        }
    }

    // ── plumbing ──────────────────────────────────────────────────────────────

    /// Invalidates any in-flight retry timer, and drops the retry context
    /// unless the command targets the station the context belongs to.
    fn cancel_pending_retry(&mut self, target_station: Option<u32>) {
        self.retry_generation += 1;
        if let Some(ctx) = &self.retry {
            if target_station != Some(ctx.station_id) {
                self.retry = None;
            }
        }
    }

    fn broadcast_state(&self) {
        // No receivers is fine (e.g. before the first client connects)
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum EngineCall {
        Load(String),
        SetPaused(bool),
        Stop,
    }

    #[derive(Clone, Default)]
    struct FakeEngine {
        calls: Arc<StdMutex<Vec<EngineCall>>>,
    }

    impl FakeEngine {
        fn calls(&self) -> Vec<EngineCall> {
            self.calls.lock().unwrap().clone()
        }

        fn loads(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    EngineCall::Load(url) => Some(url),
                    _ => None,
                })
                .collect()
        }
    }

    impl AudioEngine for FakeEngine {
        async fn load(&self, url: &str) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(EngineCall::Load(url.to_string()));
            Ok(())
        }

        async fn set_paused(&self, paused: bool) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(EngineCall::SetPaused(paused));
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(EngineCall::Stop);
            Ok(())
        }
    }

    struct FakeSource {
        base: Vec<Station>,
        overrides: StdMutex<BTreeMap<u32, String>>,
    }

    impl FakeSource {
        fn new(base: Vec<Station>) -> Arc<Self> {
            Arc::new(Self {
                base,
                overrides: StdMutex::new(BTreeMap::new()),
            })
        }
    }

    impl StationSource for FakeSource {
        async fn stations(&self) -> anyhow::Result<Vec<Station>> {
            let overrides = self.overrides.lock().unwrap();
            let mut stations = self.base.clone();
            for station in stations.iter_mut() {
                if let Some(url) = overrides.get(&station.id) {
                    station.stream_url = url.clone();
                }
            }
            Ok(stations)
        }

        async fn update_url(&self, station_id: u32, url: &str) -> anyhow::Result<Option<Station>> {
            self.overrides
                .lock()
                .unwrap()
                .insert(station_id, url.to_string());
            Ok(self
                .stations()
                .await?
                .into_iter()
                .find(|s| s.id == station_id))
        }

        async fn reset_url(&self, station_id: u32) -> anyhow::Result<Option<Station>> {
            self.overrides.lock().unwrap().remove(&station_id);
            Ok(self
                .stations()
                .await?
                .into_iter()
                .find(|s| s.id == station_id))
        }
    }

    fn station(id: u32, url: &str) -> Station {
        Station {
            id,
            name: format!("station-{}", id),
            stream_url: url.to_string(),
            icon_url: None,
            metadata: Default::default(),
        }
    }

    struct Harness {
        core: PlaybackCore<FakeEngine, FakeSource>,
        engine: FakeEngine,
        broadcast_rx: broadcast::Receiver<BroadcastMessage>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(stations: Vec<Station>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let engine = FakeEngine::default();
            let source = FakeSource::new(stations);
            let store = StateStore::new(None);
            let (event_tx, _event_rx) = mpsc::channel(64);
            let (broadcast_tx, broadcast_rx) = broadcast::channel(64);
            let core = PlaybackCore::new(
                engine.clone(),
                source,
                store,
                RetryPolicy::new(Duration::from_millis(1), 3),
                TaskMarker::new(dir.path().join("daemon.active")),
                event_tx,
                broadcast_tx,
            );
            Self {
                core,
                engine,
                broadcast_rx,
                _dir: dir,
            }
        }

        async fn command(&mut self, cmd: Command) {
            self.core.handle(CoreEvent::Command(cmd)).await;
        }

        async fn play(&mut self, station: Station) {
            self.command(Command::Play {
                station: Some(station),
            })
            .await;
        }

        async fn engine_event(&mut self, event: EngineEvent) {
            self.core.handle(CoreEvent::Engine(event)).await;
        }

        async fn focus(&mut self, change: FocusChange) {
            self.core.handle(CoreEvent::Focus(change)).await;
        }

        fn drain_broadcasts(&mut self) -> usize {
            let mut count = 0;
            while self.broadcast_rx.try_recv().is_ok() {
                count += 1;
            }
            count
        }
    }

    fn two_stations() -> Vec<Station> {
        vec![station(1, "https://a"), station(2, "https://b")]
    }

    fn three_stations() -> Vec<Station> {
        vec![
            station(1, "https://a"),
            station(2, "https://b"),
            station(3, "https://c"),
        ]
    }

    #[tokio::test]
    async fn play_then_ready_reaches_playing() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;

        let state = h.core.store.snapshot().await;
        assert_eq!(state.current_station.as_ref().unwrap().id, 1);
        assert!(state.is_playing);
        assert!(!state.is_buffering);
        assert_eq!(state.playback_status, PlaybackStatus::Playing);
        assert_eq!(h.engine.loads(), vec!["https://a"]);
    }

    #[tokio::test]
    async fn next_advances_and_plays_second_station() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;

        h.command(Command::Next).await;
        assert_eq!(
            h.core.store.snapshot().await.current_station.unwrap().id,
            2
        );
        h.engine_event(EngineEvent::Ready { paused: false }).await;

        let state = h.core.store.snapshot().await;
        assert_eq!(state.current_station.unwrap().id, 2);
        assert!(state.is_playing);
        assert_eq!(h.engine.loads(), vec!["https://a", "https://b"]);
    }

    #[tokio::test]
    async fn next_wraps_from_last_to_first() {
        let mut h = Harness::new(three_stations());
        h.play(station(3, "https://c")).await;
        h.command(Command::Next).await;
        assert_eq!(
            h.core.store.snapshot().await.current_station.unwrap().id,
            1
        );
    }

    #[tokio::test]
    async fn previous_wraps_from_first_to_last() {
        let mut h = Harness::new(three_stations());
        h.play(station(1, "https://a")).await;
        h.command(Command::Previous).await;
        assert_eq!(
            h.core.store.snapshot().await.current_station.unwrap().id,
            3
        );
    }

    #[tokio::test]
    async fn next_with_unknown_current_defaults_to_first() {
        let mut h = Harness::new(three_stations());
        // Station 99 is not in the list (removed by a sync cycle)
        h.play(station(99, "https://zombie")).await;
        h.command(Command::Next).await;
        assert_eq!(
            h.core.store.snapshot().await.current_station.unwrap().id,
            1
        );
    }

    #[tokio::test]
    async fn next_on_empty_list_is_a_noop() {
        let mut h = Harness::new(vec![]);
        let before = h.core.store.snapshot().await;
        h.command(Command::Next).await;
        h.command(Command::Previous).await;
        let after = h.core.store.snapshot().await;
        assert_eq!(after.rev, before.rev);
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn pause_twice_emits_single_broadcast() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;
        h.drain_broadcasts();

        h.command(Command::Pause).await;
        assert_eq!(h.drain_broadcasts(), 1);

        h.command(Command::Pause).await;
        assert_eq!(h.drain_broadcasts(), 0);
        assert_eq!(
            h.core.store.snapshot().await.playback_status,
            PlaybackStatus::Paused
        );
    }

    #[tokio::test]
    async fn pause_without_station_is_a_noop() {
        let mut h = Harness::new(two_stations());
        h.command(Command::Pause).await;
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn resume_after_pause_restarts_audio() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;
        h.command(Command::Pause).await;

        h.command(Command::Play { station: None }).await;
        let state = h.core.store.snapshot().await;
        assert!(state.is_playing);
        assert!(h.engine.calls().contains(&EngineCall::SetPaused(false)));
    }

    #[tokio::test]
    async fn play_with_empty_url_is_rejected() {
        let mut h = Harness::new(two_stations());
        h.play(station(5, "   ")).await;
        let state = h.core.store.snapshot().await;
        assert!(state.current_station.is_none());
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn stale_retry_is_discarded_after_station_change() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Failed(EngineError::Network("down".into())))
            .await;
        let scheduled_generation = h.core.retry_generation;
        assert!(h.core.retry.is_some());

        // User moves on before the timer fires
        h.play(station(2, "https://b")).await;
        assert!(h.core.retry.is_none());

        // The old timer fires anyway: generation mismatch, discarded
        h.core
            .handle(CoreEvent::RetryFire {
                station_id: 1,
                generation: scheduled_generation,
            })
            .await;
        assert_eq!(h.engine.loads(), vec!["https://a", "https://b"]);
        assert_eq!(
            h.core.store.snapshot().await.current_station.unwrap().id,
            2
        );
    }

    #[tokio::test]
    async fn retry_fire_checks_station_identity_as_backstop() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Failed(EngineError::Network("down".into())))
            .await;

        // Even a timer with a live generation must not retry a station the
        // user navigated away from.
        let generation = h.core.retry_generation;
        h.core.store.set_connecting(&station(2, "https://b")).await;
        h.core
            .handle(CoreEvent::RetryFire {
                station_id: 1,
                generation,
            })
            .await;
        assert_eq!(h.engine.loads(), vec!["https://a"]);
    }

    #[tokio::test]
    async fn retries_exhaust_to_terminal_error() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;

        for attempt in 1..=3u32 {
            h.engine_event(EngineEvent::Failed(EngineError::Network("down".into())))
                .await;
            assert_eq!(h.core.retry.as_ref().unwrap().attempt, attempt);
            h.core
                .handle(CoreEvent::RetryFire {
                    station_id: 1,
                    generation: h.core.retry_generation,
                })
                .await;
        }
        // Fourth consecutive failure: policy gives up
        h.engine_event(EngineEvent::Failed(EngineError::Network("down".into())))
            .await;
        assert!(h.core.retry.is_none());

        let state = h.core.store.snapshot().await;
        assert_eq!(state.playback_status, PlaybackStatus::Error);
        assert_eq!(state.last_error.as_ref().unwrap().kind, ErrorKind::Network);
        // 1 initial load + 3 retries, nothing further
        assert_eq!(h.engine.loads().len(), 4);
    }

    #[tokio::test]
    async fn successful_recovery_resets_attempt_count() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Failed(EngineError::Network("down".into())))
            .await;
        assert_eq!(h.core.retry.as_ref().unwrap().attempt, 1);

        h.engine_event(EngineEvent::Ready { paused: false }).await;
        assert!(h.core.retry.is_none());
        assert!(h.core.store.snapshot().await.last_error.is_none());
    }

    #[tokio::test]
    async fn error_classification_populates_last_error() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Failed(EngineError::Format(
            "bad container".into(),
        )))
        .await;
        let error = h.core.store.snapshot().await.last_error.unwrap();
        assert_eq!(error.kind, ErrorKind::Format);
        assert_eq!(error.station_id, 1);
        assert_eq!(error.station_name, "station-1");
    }

    #[tokio::test]
    async fn ended_stream_is_not_retried() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;
        h.engine_event(EngineEvent::Ended).await;

        let state = h.core.store.snapshot().await;
        assert!(!state.is_playing);
        assert_eq!(state.playback_status, PlaybackStatus::Idle);
        assert!(state.last_error.is_none());
        assert!(h.core.retry.is_none());
        assert!(!h.core.marker.is_active());
    }

    #[tokio::test]
    async fn stop_clears_station_and_releases_marker() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;
        assert!(h.core.marker.is_active());

        h.command(Command::Stop).await;
        let state = h.core.store.snapshot().await;
        assert!(state.current_station.is_none());
        assert_eq!(state.playback_status, PlaybackStatus::Idle);
        assert!(!h.core.marker.is_active());
        assert!(h.engine.calls().contains(&EngineCall::Stop));

        // Second stop: idempotent, no further broadcast
        h.drain_broadcasts();
        h.command(Command::Stop).await;
        assert_eq!(h.drain_broadcasts(), 0);
    }

    #[tokio::test]
    async fn permanent_focus_loss_pauses_without_auto_resume() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;

        h.focus(FocusChange::PermanentLoss).await;
        assert_eq!(
            h.core.store.snapshot().await.playback_status,
            PlaybackStatus::Paused
        );

        h.focus(FocusChange::Regained).await;
        assert_eq!(
            h.core.store.snapshot().await.playback_status,
            PlaybackStatus::Paused
        );
    }

    #[tokio::test]
    async fn transient_focus_loss_auto_resumes_on_regain() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;

        h.focus(FocusChange::TransientLoss).await;
        assert_eq!(
            h.core.store.snapshot().await.playback_status,
            PlaybackStatus::Paused
        );

        h.focus(FocusChange::Regained).await;
        let state = h.core.store.snapshot().await;
        assert_eq!(state.playback_status, PlaybackStatus::Playing);
        assert!(state.is_playing);
    }

    #[tokio::test]
    async fn manual_pause_disarms_focus_auto_resume() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;

        h.command(Command::Pause).await;
        h.focus(FocusChange::Regained).await;
        assert_eq!(
            h.core.store.snapshot().await.playback_status,
            PlaybackStatus::Paused
        );
    }

    #[tokio::test]
    async fn device_disconnect_pauses_playback() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;

        h.focus(FocusChange::DeviceDisconnected).await;
        assert_eq!(
            h.core.store.snapshot().await.playback_status,
            PlaybackStatus::Paused
        );
        h.focus(FocusChange::Regained).await;
        assert_eq!(
            h.core.store.snapshot().await.playback_status,
            PlaybackStatus::Paused
        );
    }

    #[tokio::test]
    async fn update_url_refreshes_current_station_snapshot() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.engine_event(EngineEvent::Ready { paused: false }).await;

        h.command(Command::UpdateStationUrl {
            station_id: 1,
            url: "https://a-backup".into(),
        })
        .await;
        assert_eq!(
            h.core
                .store
                .snapshot()
                .await
                .current_station
                .unwrap()
                .stream_url,
            "https://a-backup"
        );
    }

    #[tokio::test]
    async fn reset_url_clears_error_and_reattempts() {
        let mut h = Harness::new(two_stations());
        h.command(Command::UpdateStationUrl {
            station_id: 1,
            url: "https://a-broken".into(),
        })
        .await;
        h.play(station(1, "https://a-broken")).await;
        h.engine_event(EngineEvent::Failed(EngineError::Network("down".into())))
            .await;
        assert!(h.core.store.snapshot().await.last_error.is_some());

        h.command(Command::ResetStationUrl { station_id: 1 }).await;
        let state = h.core.store.snapshot().await;
        assert!(state.last_error.is_none());
        assert_eq!(state.playback_status, PlaybackStatus::Connecting);
        assert_eq!(state.current_station.unwrap().stream_url, "https://a");
        assert_eq!(
            h.engine.loads(),
            vec!["https://a-broken", "https://a"]
        );
    }

    #[tokio::test]
    async fn stale_engine_events_after_stop_are_ignored() {
        let mut h = Harness::new(two_stations());
        h.play(station(1, "https://a")).await;
        h.command(Command::Stop).await;
        h.drain_broadcasts();

        h.engine_event(EngineEvent::Ready { paused: false }).await;
        h.engine_event(EngineEvent::Failed(EngineError::Network("x".into())))
            .await;
        let state = h.core.store.snapshot().await;
        assert_eq!(state.playback_status, PlaybackStatus::Idle);
        assert!(state.last_error.is_none());
        assert_eq!(h.drain_broadcasts(), 0);
    }
}
