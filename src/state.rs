use parking_lot::RwLock;
use std::sync::Arc;

use crate::types::{ExternalState, PlaybackState};

/// Local position step applied by each ticker beat.
pub const TICK_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not playing (or unmounted); nothing changed.
    Idle,
    Advanced,
    /// The estimate ran past the duration and was reset to 0.
    Wrapped,
}

/// Widget state store. `playback` is what the view renders; the other fields
/// are bookkeeping for the synchronizer.
#[derive(Debug, Clone, Default)]
pub struct WidgetState {
    pub playback: PlaybackState,
    pub mounted: bool,
    pub requested_uri: Option<String>,
    /// Bumped on every authoritative notification.
    pub revision: u64,
    /// The local estimate ran past the duration. Ticking stops until the
    /// next notification or play flag change.
    pub track_ended: bool,
    /// Last `(device, uri)` pair a play command was issued for.
    pub last_played: Option<(String, String)>,
}

impl WidgetState {
    pub fn mounted() -> Self {
        Self {
            mounted: true,
            ..Default::default()
        }
    }

    pub fn mark_ready(&mut self, device_id: &str) {
        self.playback.device_id = Some(device_id.to_string());
        self.playback.visible = true;
    }

    /// Authoritative overwrite from a handle notification.
    /// Returns true when `is_playing` changed.
    pub fn apply(&mut self, external: ExternalState) -> bool {
        let was_playing = self.playback.is_playing;
        self.revision += 1;
        self.track_ended = false;
        self.playback.current_track = external.track;
        self.playback.is_playing = !external.paused;
        self.playback.position_ms = external.position_ms;
        self.playback.duration_ms = external.duration_ms;
        was_playing != self.playback.is_playing
    }

    pub fn tick(&mut self) -> TickOutcome {
        if !self.should_tick() {
            return TickOutcome::Idle;
        }

        let next = self.playback.position_ms.saturating_add(TICK_MS);
        if next > self.playback.duration_ms {
            self.playback.position_ms = 0;
            self.track_ended = true;
            TickOutcome::Wrapped
        } else {
            self.playback.position_ms = next;
            TickOutcome::Advanced
        }
    }

    pub fn should_tick(&self) -> bool {
        self.mounted && self.playback.is_playing && !self.track_ended
    }

    /// Returns true when the flag actually changed.
    pub fn set_playing(&mut self, playing: bool) -> bool {
        let changed = self.playback.is_playing != playing;
        self.playback.is_playing = playing;
        if changed {
            self.track_ended = false;
        }
        changed
    }

    pub fn expand(&mut self) {
        self.playback.expanded = true;
    }

    pub fn collapse(&mut self) {
        self.playback.expanded = false;
    }

    pub fn toggle_expanded(&mut self) {
        self.playback.expanded = !self.playback.expanded;
    }

    /// Positive `delta_y` is a downward scroll. Scrolling never expands.
    pub fn on_scroll(&mut self, delta_y: f64) {
        if self.playback.expanded && delta_y > 0.0 {
            self.playback.expanded = false;
        }
    }

    /// Device and URI to play, once both are known and that pair has not
    /// been played yet. The pair is recorded as played.
    pub fn take_pending_play(&mut self) -> Option<(String, String)> {
        let pair = match (&self.playback.device_id, &self.requested_uri) {
            (Some(device), Some(uri)) if !device.is_empty() && !uri.is_empty() => {
                (device.clone(), uri.clone())
            }
            _ => return None,
        };

        if self.last_played.as_ref() == Some(&pair) {
            return None;
        }
        self.last_played = Some(pair.clone());
        Some(pair)
    }
}

pub type SharedState = Arc<RwLock<WidgetState>>;

pub fn create_state() -> SharedState {
    Arc::new(RwLock::new(WidgetState::mounted()))
}
