use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Track shown by the widget. Replaced wholesale on every notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackMetadata {
    pub id: String,
    pub name: String,
    pub artist_names: Vec<String>,
    pub album_art_url: Option<String>,
}

impl TrackMetadata {
    pub fn artists_joined(&self) -> String {
        self.artist_names.join(", ")
    }
}

/// Reconciled view of what is currently playing.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PlaybackState {
    pub current_track: Option<TrackMetadata>,
    pub is_playing: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub device_id: Option<String>,
    pub visible: bool,
    pub expanded: bool,
}

/// A validated `player_state_changed` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalState {
    pub paused: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub track: Option<TrackMetadata>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("track payload is missing `{0}`")]
    MissingField(&'static str),
}

// Raw payloads as the playback SDK and the Web API send them. Everything is
// optional here; validation into the typed model happens below.

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawArtist {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawImage {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawAlbum {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub images: Vec<RawImage>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawTrack {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub artists: Vec<RawArtist>,
    #[serde(default)]
    pub album: Option<RawAlbum>,
    #[serde(default)]
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTrackWindow {
    #[serde(default)]
    pub current_track: Option<RawTrack>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPlayerState {
    #[serde(default = "default_paused")]
    pub paused: bool,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub track_window: RawTrackWindow,
}

fn default_paused() -> bool {
    true
}

impl TryFrom<&RawTrack> for TrackMetadata {
    type Error = SchemaError;

    fn try_from(raw: &RawTrack) -> Result<Self, Self::Error> {
        let id = raw
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(SchemaError::MissingField("id"))?;
        let name = raw
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(SchemaError::MissingField("name"))?;

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            artist_names: raw
                .artists
                .iter()
                .filter(|a| !a.name.is_empty())
                .map(|a| a.name.clone())
                .collect(),
            album_art_url: raw
                .album
                .as_ref()
                .and_then(|album| album.images.first())
                .map(|image| image.url.clone()),
        })
    }
}

impl From<RawPlayerState> for ExternalState {
    fn from(raw: RawPlayerState) -> Self {
        let track = raw.track_window.current_track.as_ref().and_then(|t| {
            TrackMetadata::try_from(t)
                .map_err(|e| log::warn!("Dropping invalid track metadata: {}", e))
                .ok()
        });

        Self {
            paused: raw.paused,
            position_ms: raw.position,
            duration_ms: raw.duration,
            track,
        }
    }
}

/// Messages the playback bridge writes to its stdout, one JSON object per line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Ready {
        device_id: String,
    },
    NotReady {
        device_id: String,
    },
    PlayerStateChanged {
        #[serde(default)]
        state: Option<RawPlayerState>,
    },
    TokenRequest,
    Ack {
        id: u64,
        ok: bool,
        #[serde(default)]
        connected: Option<bool>,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        kind: String,
        message: String,
    },
}

/// Commands written to the bridge's stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BridgeCommand {
    Connect { id: u64, name: String, volume: f32 },
    TogglePlay { id: u64 },
    Disconnect,
    Token { token: String },
}
