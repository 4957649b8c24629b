//! Playback widget synchronizer.
//!
//! Reconciles three sources into one [`PlaybackState`]: notifications from
//! the external playback handle (authoritative), the local progress ticker
//! (extrapolation between notifications) and user commands (optimistic).

use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::bus::{EventBus, WidgetEvent};
use crate::commands::PlaybackApi;
use crate::handle::{HandleError, HandleEvent, PlaybackHandle, Subscription};
use crate::state::{create_state, SharedState, TickOutcome};
use crate::ticker::ProgressTicker;
use crate::types::{ExternalState, PlaybackState};

pub const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Mount {
    subscription: Option<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PlayerSynchronizer {
    state: SharedState,
    api: Arc<dyn PlaybackApi>,
    bus: EventBus,
    command_timeout: Duration,
    handle: RwLock<Option<Arc<dyn PlaybackHandle>>>,
    ticker: Mutex<ProgressTicker>,
    // Serializes toggle / pause so they reach the device in click order.
    command_lock: tokio::sync::Mutex<()>,
    mount: Mutex<Mount>,
}

/// Await `fut`, mapping an elapsed timeout to `None`.
async fn bounded<T>(limit: Duration, fut: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(limit, fut).await.ok()
}

impl PlayerSynchronizer {
    pub fn new(api: Arc<dyn PlaybackApi>, bus: EventBus, command_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: create_state(),
            api,
            bus,
            command_timeout,
            handle: RwLock::new(None),
            ticker: Mutex::new(ProgressTicker::new(TICK_PERIOD)),
            command_lock: tokio::sync::Mutex::new(()),
            mount: Mutex::new(Mount::default()),
        })
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn snapshot(&self) -> PlaybackState {
        self.state.read().playback.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn has_handle(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Mount against `handle`: subscribe to its events, listen on the bus
    /// and connect. Returns what the handle's connect reported.
    pub async fn attach(self: &Arc<Self>, handle: Arc<dyn PlaybackHandle>) -> Result<bool, HandleError> {
        let (sink, events) = unbounded_channel();
        let subscription = handle.subscribe(sink);
        *self.handle.write() = Some(handle.clone());

        let pump = tokio::spawn(Self::pump_events(Arc::downgrade(self), events));
        let listener = tokio::spawn(Self::listen_bus(Arc::downgrade(self), self.bus.subscribe()));
        {
            let mut mount = self.mount.lock();
            mount.subscription = Some(subscription);
            mount.tasks.push(pump);
            mount.tasks.push(listener);
        }

        let connected = bounded(self.command_timeout, handle.connect())
            .await
            .unwrap_or(Err(HandleError::Timeout))?;
        if connected {
            log::info!("Playback handle connected");
        } else {
            log::warn!("Playback handle refused to connect");
        }
        Ok(connected)
    }

    async fn pump_events(this: Weak<Self>, mut events: UnboundedReceiver<HandleEvent>) {
        while let Some(event) = events.recv().await {
            let Some(this) = this.upgrade() else { break };
            this.handle_event(event).await;
        }
        log::debug!("Handle event pump stopped");
    }

    async fn listen_bus(this: Weak<Self>, mut bus: tokio::sync::broadcast::Receiver<WidgetEvent>) {
        loop {
            match bus.recv().await {
                Ok(WidgetEvent::ExpandPlayer) => match this.upgrade() {
                    Some(this) => this.expand(),
                    None => break,
                },
                Ok(WidgetEvent::PlayStateChanged { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Bus listener lagged, skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    pub async fn handle_event(&self, event: HandleEvent) {
        match event {
            HandleEvent::Ready { device_id } => self.on_ready(&device_id).await,
            HandleEvent::NotReady { device_id } => {
                log::warn!("Device {} went offline", device_id);
            }
            HandleEvent::StateChanged(Some(external)) => self.on_state_changed(external),
            HandleEvent::StateChanged(None) => {
                log::debug!("Ignoring empty player state");
            }
            HandleEvent::Error { kind, message } => {
                log::error!("Playback handle error ({}): {}", kind, message);
            }
        }
    }

    /// The handle is usable. Shows the widget and plays any pending request.
    pub async fn on_ready(&self, device_id: &str) {
        {
            let mut state = self.state.write();
            if !state.mounted {
                return;
            }
            state.mark_ready(device_id);
        }
        log::info!("Ready with device ID {}", device_id);
        self.play_pending().await;
    }

    /// Authoritative overwrite from the handle.
    pub fn on_state_changed(&self, external: ExternalState) {
        {
            let mut state = self.state.write();
            if !state.mounted {
                return;
            }
            log::debug!(
                "Player state: paused={} position={} duration={}",
                external.paused,
                external.position_ms,
                external.duration_ms
            );
            state.apply(external);
        }
        self.sync_ticker();
    }

    pub fn tick(&self) -> TickOutcome {
        self.state.write().tick()
    }

    pub fn is_ticking(&self) -> bool {
        self.ticker.lock().is_running()
    }

    /// Start or cancel the ticker to match the current play flag.
    ///
    /// The ticker lock is taken before the state is read, so the decision and
    /// the start/stop happen as one step. Lock order is ticker, then state.
    fn sync_ticker(&self) {
        let mut ticker = self.ticker.lock();
        let should_tick = self.state.read().should_tick();
        if should_tick {
            ticker.start(self.state.clone());
        } else {
            ticker.stop();
        }
    }

    fn set_playing(&self, playing: bool) -> bool {
        let changed = {
            let mut state = self.state.write();
            state.mounted && state.set_playing(playing)
        };
        if changed {
            self.sync_ticker();
        }
        changed
    }

    /// Flip play/pause. Silently ignored without a handle.
    ///
    /// The flip is applied and broadcast before the command completes. If the
    /// command fails or times out the flip is reverted, unless a notification
    /// arrived in the meantime.
    pub async fn toggle_play(&self) {
        let Some(handle) = self.handle.read().clone() else {
            log::debug!("Toggle ignored, no playback handle");
            return;
        };

        let _sequence = self.command_lock.lock().await;

        let (intended, revision) = {
            let mut state = self.state.write();
            if !state.mounted {
                return;
            }
            let intended = !state.playback.is_playing;
            state.set_playing(intended);
            (intended, state.revision)
        };
        self.sync_ticker();
        self.bus.publish(WidgetEvent::PlayStateChanged { is_playing: intended });

        let result = bounded(self.command_timeout, handle.toggle_play())
            .await
            .unwrap_or(Err(HandleError::Timeout));

        if let Err(e) = result {
            let reverted = {
                let mut state = self.state.write();
                if state.mounted
                    && state.revision == revision
                    && state.playback.is_playing == intended
                {
                    state.set_playing(!intended)
                } else {
                    false
                }
            };

            if reverted {
                log::warn!("Toggle failed, reverted to playing={}: {}", !intended, e);
                self.sync_ticker();
                self.bus.publish(WidgetEvent::PlayStateChanged { is_playing: !intended });
            } else {
                log::warn!("Toggle failed: {}", e);
            }
        }
    }

    /// Pause through the Web API. The flag only changes once the command
    /// succeeds.
    pub async fn pause(&self) {
        let Some(device_id) = self.state.read().playback.device_id.clone() else {
            log::debug!("Pause ignored, no device yet");
            return;
        };

        let _sequence = self.command_lock.lock().await;

        match bounded(self.command_timeout, self.api.pause(&device_id)).await {
            Some(Ok(())) => {
                if self.set_playing(false) {
                    self.bus.publish(WidgetEvent::PlayStateChanged { is_playing: false });
                }
            }
            Some(Err(e)) => log::warn!("Pause on {} failed: {}", device_id, e),
            None => log::warn!("Pause on {} timed out", device_id),
        }
    }

    /// The selected track changed. Plays it as soon as a device is ready.
    pub async fn request_track(&self, track_uri: &str) {
        {
            let mut state = self.state.write();
            if !state.mounted {
                return;
            }
            state.requested_uri = Some(track_uri.to_string()).filter(|uri| !uri.is_empty());
        }
        self.play_pending().await;
    }

    async fn play_pending(&self) {
        let Some((device_id, uri)) = self.state.write().take_pending_play() else {
            return;
        };

        match bounded(self.command_timeout, self.api.play_track(&device_id, &uri)).await {
            Some(Ok(())) => log::info!("Started {} on {}", uri, device_id),
            Some(Err(e)) => log::error!("Failed to start {} on {}: {}", uri, device_id, e),
            None => log::error!("Starting {} on {} timed out", uri, device_id),
        }
    }

    pub fn expand(&self) {
        self.state.write().expand();
    }

    pub fn collapse(&self) {
        self.state.write().collapse();
    }

    pub fn toggle_expanded(&self) {
        self.state.write().toggle_expanded();
    }

    pub fn on_scroll(&self, delta_y: f64) {
        self.state.write().on_scroll(delta_y);
    }

    /// Tear down: no state mutation happens after this returns.
    pub fn unmount(&self) {
        {
            let mut state = self.state.write();
            if !state.mounted {
                return;
            }
            state.mounted = false;
        }

        self.ticker.lock().stop();

        let mount = std::mem::take(&mut *self.mount.lock());
        for task in mount.tasks {
            task.abort();
        }
        drop(mount.subscription);

        if let Some(handle) = self.handle.write().take() {
            handle.disconnect();
        }
        log::info!("Player widget unmounted");
    }
}

impl Drop for PlayerSynchronizer {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandError;
    use crate::handle::Listeners;
    use crate::types::TrackMetadata;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type Hook = Box<dyn Fn() + Send + Sync>;

    #[derive(Default)]
    struct FakeHandle {
        listeners: Listeners,
        toggles: AtomicUsize,
        fail_toggle: AtomicBool,
        disconnected: AtomicBool,
        during_toggle: Mutex<Option<Hook>>,
    }

    #[async_trait]
    impl PlaybackHandle for FakeHandle {
        fn subscribe(&self, sink: tokio::sync::mpsc::UnboundedSender<HandleEvent>) -> Subscription {
            self.listeners.add(sink)
        }

        async fn connect(&self) -> Result<bool, HandleError> {
            Ok(true)
        }

        fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }

        async fn toggle_play(&self) -> Result<(), HandleError> {
            self.toggles.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = self.during_toggle.lock().as_ref() {
                hook();
            }
            if self.fail_toggle.load(Ordering::SeqCst) {
                return Err(HandleError::Rejected("no active device".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingApi {
        calls: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl RecordingApi {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn result(&self) -> Result<(), CommandError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(CommandError::Status {
                    status: 404,
                    message: "Device not found".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl PlaybackApi for RecordingApi {
        async fn play_track(&self, device_id: &str, track_uri: &str) -> Result<(), CommandError> {
            self.calls.lock().push(format!("play {} {}", device_id, track_uri));
            self.result()
        }

        async fn pause(&self, device_id: &str) -> Result<(), CommandError> {
            self.calls.lock().push(format!("pause {}", device_id));
            self.result()
        }
    }

    fn track(id: &str) -> TrackMetadata {
        TrackMetadata {
            id: id.to_string(),
            name: "Song".to_string(),
            artist_names: vec!["Artist".to_string()],
            album_art_url: Some("https://img/1".to_string()),
        }
    }

    fn playing(position_ms: u64, duration_ms: u64) -> ExternalState {
        ExternalState {
            paused: false,
            position_ms,
            duration_ms,
            track: Some(track("T")),
        }
    }

    fn setup() -> (Arc<PlayerSynchronizer>, Arc<RecordingApi>) {
        let api = Arc::new(RecordingApi::default());
        let sync = PlayerSynchronizer::new(api.clone(), EventBus::new(), Duration::from_secs(5));
        (sync, api)
    }

    async fn attached() -> (Arc<PlayerSynchronizer>, Arc<RecordingApi>, Arc<FakeHandle>) {
        let (sync, api) = setup();
        let handle = Arc::new(FakeHandle::default());
        let connected = sync.attach(handle.clone()).await.unwrap();
        assert!(connected);
        (sync, api, handle)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_ready_makes_widget_visible() {
        let (sync, _api) = setup();
        assert!(!sync.snapshot().visible);

        sync.on_ready("dev1").await;

        let state = sync.snapshot();
        assert!(state.visible);
        assert_eq!(state.device_id.as_deref(), Some("dev1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_overwrites_and_starts_ticker() {
        let (sync, _api) = setup();
        sync.on_state_changed(playing(30000, 180000));

        let state = sync.snapshot();
        assert!(state.is_playing);
        assert_eq!(state.position_ms, 30000);
        assert_eq!(state.duration_ms, 180000);
        assert_eq!(state.current_track, Some(track("T")));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(sync.snapshot().position_ms, 32000);

        sync.on_state_changed(playing(90000, 180000));
        assert_eq!(sync.snapshot().position_ms, 90000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_notification_cancels_ticker() {
        let (sync, _api) = setup();
        sync.on_state_changed(playing(0, 180000));
        sync.on_state_changed(ExternalState {
            paused: true,
            ..playing(4000, 180000)
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sync.snapshot().position_ms, 4000);
        assert_eq!(sync.tick(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_toggle_without_handle_is_noop() {
        let (sync, api) = setup();
        let mut bus = sync.bus().subscribe();

        sync.toggle_play().await;

        assert!(!sync.snapshot().is_playing);
        assert!(api.calls().is_empty());
        assert!(bus.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_toggle_flips_and_broadcasts() {
        let (sync, _api, handle) = attached().await;
        let mut bus = sync.bus().subscribe();

        sync.toggle_play().await;

        assert!(sync.snapshot().is_playing);
        assert_eq!(handle.toggles.load(Ordering::SeqCst), 1);
        assert_eq!(
            bus.recv().await.unwrap(),
            WidgetEvent::PlayStateChanged { is_playing: true }
        );
    }

    #[tokio::test]
    async fn test_failed_toggle_is_rolled_back() {
        let (sync, _api, handle) = attached().await;
        handle.fail_toggle.store(true, Ordering::SeqCst);
        let mut bus = sync.bus().subscribe();

        sync.toggle_play().await;

        assert!(!sync.snapshot().is_playing);
        assert_eq!(
            bus.recv().await.unwrap(),
            WidgetEvent::PlayStateChanged { is_playing: true }
        );
        assert_eq!(
            bus.recv().await.unwrap(),
            WidgetEvent::PlayStateChanged { is_playing: false }
        );
    }

    #[tokio::test]
    async fn test_failed_toggle_keeps_newer_notification() {
        let (sync, _api, handle) = attached().await;
        handle.fail_toggle.store(true, Ordering::SeqCst);
        let state = sync.state();
        *handle.during_toggle.lock() = Some(Box::new(move || {
            state.write().apply(ExternalState {
                paused: false,
                position_ms: 1000,
                duration_ms: 5000,
                track: None,
            });
        }));

        sync.toggle_play().await;

        let snapshot = sync.snapshot();
        assert!(snapshot.is_playing);
        assert_eq!(snapshot.position_ms, 1000);
    }

    #[tokio::test]
    async fn test_track_requested_before_ready_plays_on_ready() {
        let (sync, api) = setup();

        sync.request_track("spotify:track:1").await;
        assert!(api.calls().is_empty());

        sync.on_ready("dev1").await;
        assert_eq!(api.calls(), vec!["play dev1 spotify:track:1"]);

        sync.request_track("spotify:track:2").await;
        assert_eq!(api.calls().len(), 2);
        assert_eq!(api.calls()[1], "play dev1 spotify:track:2");
    }

    #[tokio::test]
    async fn test_failed_play_is_not_retried() {
        let (sync, api) = setup();
        api.fail.store(true, Ordering::SeqCst);
        sync.on_ready("dev1").await;

        sync.request_track("spotify:track:1").await;
        settle().await;
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_waits_for_acknowledgement() {
        let (sync, api) = setup();
        sync.on_ready("dev1").await;
        sync.on_state_changed(playing(0, 180000));

        api.fail.store(true, Ordering::SeqCst);
        sync.pause().await;
        assert!(sync.snapshot().is_playing);

        api.fail.store(false, Ordering::SeqCst);
        sync.pause().await;
        assert!(!sync.snapshot().is_playing);
        assert_eq!(api.calls(), vec!["pause dev1", "pause dev1"]);
    }

    #[tokio::test]
    async fn test_scroll_down_collapses_one_way() {
        let (sync, _api) = setup();
        sync.toggle_expanded();
        assert!(sync.snapshot().expanded);

        sync.on_scroll(40.0);
        assert!(!sync.snapshot().expanded);
        sync.on_scroll(-40.0);
        assert!(!sync.snapshot().expanded);
    }

    #[tokio::test]
    async fn test_handle_events_and_bus_expand() {
        let (sync, _api, handle) = attached().await;

        handle.listeners.emit(HandleEvent::Ready {
            device_id: "dev9".into(),
        });
        handle.listeners.emit(HandleEvent::StateChanged(Some(ExternalState {
            paused: true,
            position_ms: 1500,
            duration_ms: 9000,
            track: None,
        })));
        sync.bus().publish(WidgetEvent::ExpandPlayer);
        settle().await;

        let state = sync.snapshot();
        assert!(state.visible);
        assert!(state.expanded);
        assert_eq!(state.position_ms, 1500);
        assert_eq!(state.current_track, None);
    }

    #[tokio::test]
    async fn test_repeated_ready_does_not_restart_track() {
        let (sync, api) = setup();
        sync.request_track("spotify:track:1").await;

        sync.on_ready("dev1").await;
        sync.on_ready("dev1").await;
        assert_eq!(api.calls(), vec!["play dev1 spotify:track:1"]);

        sync.on_ready("dev2").await;
        assert_eq!(
            api.calls(),
            vec!["play dev1 spotify:track:1", "play dev2 spotify:track:1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_stays_at_zero_after_wrap() {
        let (sync, _api) = setup();
        sync.on_state_changed(playing(2500, 3000));

        let mut positions = Vec::new();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            positions.push(sync.snapshot().position_ms);
        }
        assert_eq!(positions, vec![0, 0, 0]);
        assert!(!sync.is_ticking());

        sync.on_state_changed(playing(0, 180000));
        assert!(sync.is_ticking());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sync.snapshot().position_ms, 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ticker_matches_flag_after_concurrent_updates() {
        let (sync, _api) = setup();

        let mut tasks = Vec::new();
        for worker in 0..8u64 {
            let sync = sync.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..200u64 {
                    sync.on_state_changed(ExternalState {
                        paused: (i + worker) % 2 == 0,
                        position_ms: 0,
                        duration_ms: 600_000,
                        track: None,
                    });
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(sync.is_ticking(), sync.snapshot().is_playing);
        sync.unmount();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_stops_everything() {
        let (sync, _api, handle) = attached().await;
        sync.on_state_changed(playing(0, 180000));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sync.snapshot().position_ms, 1000);

        sync.unmount();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(sync.snapshot().position_ms, 1000);
        assert!(handle.disconnected.load(Ordering::SeqCst));
        assert!(handle.listeners.is_empty());
        assert!(!sync.has_handle());

        sync.toggle_play().await;
        assert_eq!(handle.toggles.load(Ordering::SeqCst), 0);
    }
}
