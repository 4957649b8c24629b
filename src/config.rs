use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:3000/auth/spotify/callback";
pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1";
pub const DEFAULT_ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_BRIDGE: &str = "playback-bridge";
pub const DEFAULT_PLAYER_NAME: &str = "Mood Music Player";
pub const DEFAULT_VOLUME: f32 = 0.5;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub access_token: Option<String>,
    pub api_base: String,
    pub accounts_base: String,
    pub openai_api_key: Option<String>,
    pub openai_base: String,
    pub openai_model: String,
    pub bridge_program: String,
    pub player_name: String,
    pub volume: f32,
    pub command_timeout: Duration,
}

impl Config {
    /// Read from the process environment (after `.env` has been loaded).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let volume = match get("MOODPLAY_VOLUME") {
            Some(raw) => raw
                .parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| v.clamp(0.0, 1.0))
                .ok_or(ConfigError::Invalid {
                    key: "MOODPLAY_VOLUME",
                    value: raw,
                })?,
            None => DEFAULT_VOLUME,
        };

        let timeout_ms = match get("MOODPLAY_COMMAND_TIMEOUT_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or(ConfigError::Invalid {
                    key: "MOODPLAY_COMMAND_TIMEOUT_MS",
                    value: raw,
                })?,
            None => DEFAULT_COMMAND_TIMEOUT_MS,
        };

        Ok(Self {
            client_id: get("SPOTIFY_CLIENT_ID"),
            client_secret: get("SPOTIFY_CLIENT_SECRET"),
            redirect_uri: or("SPOTIFY_REDIRECT_URI", DEFAULT_REDIRECT_URI),
            access_token: get("SPOTIFY_ACCESS_TOKEN"),
            api_base: or("SPOTIFY_API_BASE", DEFAULT_API_BASE),
            accounts_base: or("SPOTIFY_ACCOUNTS_BASE", DEFAULT_ACCOUNTS_BASE),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base: or("OPENAI_API_BASE", DEFAULT_OPENAI_BASE),
            openai_model: or("OPENAI_MODEL", DEFAULT_OPENAI_MODEL),
            bridge_program: or("MOODPLAY_BRIDGE", DEFAULT_BRIDGE),
            player_name: or("MOODPLAY_PLAYER_NAME", DEFAULT_PLAYER_NAME),
            volume,
            command_timeout: Duration::from_millis(timeout_ms),
        })
    }

    pub fn require_access_token(&self) -> Result<&str, ConfigError> {
        self.access_token
            .as_deref()
            .ok_or(ConfigError::Missing("SPOTIFY_ACCESS_TOKEN"))
    }

    pub fn require_credentials(&self) -> Result<(&str, &str), ConfigError> {
        let id = self
            .client_id
            .as_deref()
            .ok_or(ConfigError::Missing("SPOTIFY_CLIENT_ID"))?;
        let secret = self
            .client_secret
            .as_deref()
            .ok_or(ConfigError::Missing("SPOTIFY_CLIENT_SECRET"))?;
        Ok((id, secret))
    }
}
