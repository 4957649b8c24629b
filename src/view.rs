use serde::Serialize;

use crate::types::PlaybackState;

pub const PREMIUM_HINT: &str = "Spotify Premium required to play tracks";

/// `m:ss`, seconds zero-padded.
pub fn format_time(ms: u64) -> String {
    let seconds = ms / 1000;
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

/// Share of the track played, in percent. 0 for an unknown duration.
pub fn progress_percent(position_ms: u64, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        return 0.0;
    }
    (position_ms as f64 / duration_ms as f64 * 100.0).min(100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonIntent {
    Play,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiniPlayer {
    pub name: String,
    pub album_art_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullPlayer {
    pub name: Option<String>,
    pub artists: Option<String>,
    pub album_art_url: Option<String>,
    pub elapsed: String,
    pub total: String,
    pub percent: f64,
}

/// Everything the rendering layer needs, derived from the state store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetView {
    pub visible: bool,
    pub expanded: bool,
    pub handle_label: &'static str,
    pub button: ButtonIntent,
    pub mini: Option<MiniPlayer>,
    pub full: FullPlayer,
    pub hint: &'static str,
}

impl WidgetView {
    pub fn from_state(state: &PlaybackState) -> Self {
        let track = state.current_track.as_ref();

        let mini = match track {
            Some(track) if !state.expanded => Some(MiniPlayer {
                name: track.name.clone(),
                album_art_url: track.album_art_url.clone(),
            }),
            _ => None,
        };

        Self {
            visible: state.visible,
            expanded: state.expanded,
            handle_label: if state.expanded { "Hide Player" } else { "Show Player" },
            button: if state.is_playing {
                ButtonIntent::Pause
            } else {
                ButtonIntent::Play
            },
            mini,
            full: FullPlayer {
                name: track.map(|t| t.name.clone()),
                artists: track.map(|t| t.artists_joined()),
                album_art_url: track.and_then(|t| t.album_art_url.clone()),
                elapsed: format_time(state.position_ms),
                total: format_time(state.duration_ms),
                percent: progress_percent(state.position_ms, state.duration_ms),
            },
            hint: PREMIUM_HINT,
        }
    }

    /// One-line terminal rendering.
    pub fn render_line(&self) -> String {
        if !self.visible {
            return "(player hidden)".to_string();
        }

        let action = match self.button {
            ButtonIntent::Play => "▶",
            ButtonIntent::Pause => "⏸",
        };

        match (&self.mini, self.expanded) {
            (Some(mini), false) => format!("{} {}  [{}]", action, mini.name, self.handle_label),
            _ => {
                let title = match (&self.full.name, &self.full.artists) {
                    (Some(name), Some(artists)) if !artists.is_empty() => {
                        format!("{} - {}", name, artists)
                    }
                    (Some(name), _) => name.clone(),
                    _ => String::new(),
                };
                format!(
                    "{} {} {}/{} ({:.0}%)  [{}]",
                    action,
                    title,
                    self.full.elapsed,
                    self.full.total,
                    self.full.percent,
                    self.handle_label
                )
            }
        }
    }
}
