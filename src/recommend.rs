//! Mood-based recommendations: ask the text-generation provider for a track
//! list, then resolve every suggestion against the Web API search.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::commands::{status_error, CommandError, SharedToken};
use crate::types::{RawTrack, TrackMetadata};

pub const DEFAULT_NUM_TRACKS: u32 = 12;

const PERSONA: &str = "You are an AI music assistant with extensive knowledge of global pop music \
available on Spotify. You specialize in recommending songs based on the user's mood and emotional \
intensity. Ensure that each recommendation list is unique and does not repeat the previous list.";

const REPLY_FORMAT: &str = "Always reply with a JSON array named 'tracks' containing objects with \
'track' for the song name and 'artist' for the artist name. Use strategies such as random \
selection, shuffling, or introducing new songs to ensure diversity. Include songs from various \
languages and regions to provide a global music experience.";

#[derive(Debug, Error)]
pub enum RecommendError {
    #[error("OpenAI API key is not configured. Please check your environment variables.")]
    MissingApiKey,
    #[error("Invalid OpenAI API key. Please check your configuration.")]
    InvalidApiKey,
    #[error("Insufficient credits. Please check your OpenAI account balance.")]
    InsufficientCredits,
    #[error("Rate limit exceeded. Please try again later or upgrade your OpenAI plan.")]
    RateLimited,
    #[error("OpenAI server error. Please try again later.")]
    ServerError,
    #[error("OpenAI service is temporarily unavailable. Please try again later.")]
    Unavailable,
    #[error("OpenAI API error: {message}")]
    Api { status: u16, message: String },
    #[error("Invalid response format from OpenAI. Please try again.")]
    InvalidResponse,
    #[error("Could not connect to OpenAI servers. Please check your internet connection.")]
    Unreachable(#[source] reqwest::Error),
    #[error("Session expired. Please login again.")]
    SessionExpired,
    #[error("Track search failed: {0}")]
    Search(#[from] CommandError),
}

impl RecommendError {
    /// HTTP status a web front end should answer with.
    pub fn status(&self) -> u16 {
        match self {
            RecommendError::MissingApiKey
            | RecommendError::InvalidApiKey
            | RecommendError::SessionExpired => 401,
            RecommendError::InsufficientCredits => 402,
            RecommendError::RateLimited => 429,
            RecommendError::Unavailable => 503,
            RecommendError::Api { status, .. } => *status,
            RecommendError::ServerError
            | RecommendError::InvalidResponse
            | RecommendError::Unreachable(_)
            | RecommendError::Search(_) => 500,
        }
    }
}

macro_rules! choice_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name).to_lowercase(), other)),
                }
            }
        }
    };
}

choice_enum!(Mood { Happy => "happy", Sad => "sad" });
choice_enum!(Style { Light => "light", Dark => "dark" });
choice_enum!(Rhythm { Fast => "fast", Slow => "slow" });

/// Coarse reading of a 0-100 slider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntensityBand {
    Low,
    Medium,
    High,
}

impl IntensityBand {
    pub fn of(intensity: u8) -> Self {
        if intensity < 33 {
            IntensityBand::Low
        } else if intensity < 66 {
            IntensityBand::Medium
        } else {
            IntensityBand::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntensityBand::Low => "low",
            IntensityBand::Medium => "medium",
            IntensityBand::High => "high",
        }
    }
}

impl fmt::Display for IntensityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousTrack {
    pub name: String,
    pub artists: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MoodRequest {
    pub mood: Mood,
    pub mood_intensity: u8,
    pub style: Style,
    pub style_intensity: u8,
    pub rhythm: Rhythm,
    pub rhythm_intensity: u8,
    pub num_tracks: u32,
    pub previous_tracks: Vec<PreviousTrack>,
}

impl MoodRequest {
    pub fn new(mood: Mood) -> Self {
        Self {
            mood,
            mood_intensity: 100,
            style: Style::Light,
            style_intensity: 50,
            rhythm: Rhythm::Fast,
            rhythm_intensity: 50,
            num_tracks: DEFAULT_NUM_TRACKS,
            previous_tracks: Vec::new(),
        }
    }

    pub fn with_mood_intensity(mut self, intensity: u8) -> Self {
        self.mood_intensity = intensity.min(100);
        self
    }

    pub fn with_style(mut self, style: Style, intensity: u8) -> Self {
        self.style = style;
        self.style_intensity = intensity.min(100);
        self
    }

    pub fn with_rhythm(mut self, rhythm: Rhythm, intensity: u8) -> Self {
        self.rhythm = rhythm;
        self.rhythm_intensity = intensity.min(100);
        self
    }

    pub fn excluding(mut self, previous: Vec<PreviousTrack>) -> Self {
        self.previous_tracks = previous;
        self
    }

    /// Band of the mood slider, used to shade the mood card.
    pub fn mood_band(&self) -> IntensityBand {
        IntensityBand::of(self.mood_intensity)
    }

    pub fn prompt(&self) -> String {
        let mut prompt = format!(
            "Please recommend {} tracks that match the following criteria:\n\
             - Mood: {}, Intensity: {}%\n\
             - Style: {}, Intensity: {}%\n\
             - Rhythm: {}, Intensity: {}%\n",
            self.num_tracks,
            self.mood,
            self.mood_intensity,
            self.style,
            self.style_intensity,
            self.rhythm,
            self.rhythm_intensity,
        );

        if !self.previous_tracks.is_empty() {
            let listed = serde_json::to_string_pretty(&self.previous_tracks).unwrap_or_default();
            prompt.push_str(&format!(
                "Please DO NOT include these previously recommended songs: {}\n",
                listed
            ));
        }

        prompt.push_str(
            "Ensure these songs are available on Spotify and that the list is completely \
             different from the previous recommendations.\n",
        );
        prompt.push_str(&format!(
            "For {} style with {}% intensity, prefer {} songs.\n",
            self.style,
            self.style_intensity,
            match self.style {
                Style::Light => "brighter and more uplifting",
                Style::Dark => "darker and more atmospheric",
            }
        ));
        prompt.push_str(&format!(
            "For {} rhythm with {}% intensity, prefer {} songs.",
            self.rhythm,
            self.rhythm_intensity,
            match self.rhythm {
                Rhythm::Fast => "higher tempo and more energetic",
                Rhythm::Slow => "slower tempo and more relaxed",
            }
        ));
        prompt
    }

    fn messages(&self) -> serde_json::Value {
        json!([
            { "role": "system", "content": PERSONA },
            { "role": "system", "content": REPLY_FORMAT },
            { "role": "user", "content": self.prompt() },
        ])
    }
}

/// One line of the provider's answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Suggestion {
    pub track: String,
    pub artist: String,
}

#[derive(Debug, Deserialize)]
struct SuggestionList {
    tracks: Vec<Suggestion>,
}

/// Parse the provider's message content into suggestions.
pub fn parse_suggestions(content: &str) -> Result<Vec<Suggestion>, RecommendError> {
    let trimmed = content.trim();
    // Some answers arrive wrapped in a fenced code block.
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);

    serde_json::from_str::<SuggestionList>(body.trim())
        .map(|list| list.tracks)
        .map_err(|e| {
            log::warn!("Unparseable recommendation payload: {}", e);
            RecommendError::InvalidResponse
        })
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: SearchPage,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<RawTrack>,
}

/// A recommendation that resolved to a playable catalogue track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecommendedTrack {
    pub uri: String,
    pub preview_url: Option<String>,
    pub metadata: TrackMetadata,
}

impl RecommendedTrack {
    fn from_raw(raw: &RawTrack) -> Option<Self> {
        let metadata = TrackMetadata::try_from(raw)
            .map_err(|e| log::warn!("Skipping search hit: {}", e))
            .ok()?;
        let uri = raw
            .uri
            .clone()
            .unwrap_or_else(|| format!("spotify:track:{}", metadata.id));
        Some(Self {
            uri,
            preview_url: raw.preview_url.clone(),
            metadata,
        })
    }
}

/// History entries for the next request, so it does not repeat these.
pub fn history_of(tracks: &[RecommendedTrack]) -> Vec<PreviousTrack> {
    tracks
        .iter()
        .map(|t| PreviousTrack {
            name: t.metadata.name.clone(),
            artists: t.metadata.artist_names.clone(),
        })
        .collect()
}

pub struct Recommender {
    http: reqwest::Client,
    openai_base: String,
    openai_key: Option<String>,
    model: String,
    api_base: String,
    token: SharedToken,
}

impl Recommender {
    pub fn new(
        openai_base: &str,
        openai_key: Option<String>,
        model: &str,
        api_base: &str,
        token: SharedToken,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            openai_base: openai_base.trim_end_matches('/').to_string(),
            openai_key,
            model: model.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub async fn recommend(&self, request: &MoodRequest) -> Result<Vec<RecommendedTrack>, RecommendError> {
        log::info!(
            "Recommending {} tracks: mood={} ({}%) style={} ({}%) rhythm={} ({}%), excluding {}",
            request.num_tracks,
            request.mood,
            request.mood_intensity,
            request.style,
            request.style_intensity,
            request.rhythm,
            request.rhythm_intensity,
            request.previous_tracks.len()
        );

        let suggestions = self.suggest(request).await?;
        self.resolve(&suggestions).await
    }

    /// Ask the provider for a track list.
    pub async fn suggest(&self, request: &MoodRequest) -> Result<Vec<Suggestion>, RecommendError> {
        let key = self.openai_key.as_deref().ok_or(RecommendError::MissingApiKey)?;

        let response = self
            .http
            .post(format!("{}/chat/completions", self.openai_base))
            .bearer_auth(key)
            .json(&json!({
                "model": self.model,
                "messages": request.messages(),
            }))
            .send()
            .await
            .map_err(RecommendError::Unreachable)?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            401 => return Err(RecommendError::InvalidApiKey),
            402 => return Err(RecommendError::InsufficientCredits),
            429 => return Err(RecommendError::RateLimited),
            500 => return Err(RecommendError::ServerError),
            503 => return Err(RecommendError::Unavailable),
            _ => {
                let message = match status_error(response).await {
                    CommandError::Status { message, .. } => message,
                    other => other.to_string(),
                };
                return Err(RecommendError::Api { status, message });
            }
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|_| RecommendError::InvalidResponse)?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(RecommendError::InvalidResponse)?;

        log::debug!("Provider answer: {}", content);
        parse_suggestions(&content)
    }

    /// Look every suggestion up in the catalogue. Misses are dropped.
    pub async fn resolve(&self, suggestions: &[Suggestion]) -> Result<Vec<RecommendedTrack>, RecommendError> {
        let lookups = suggestions.iter().map(|s| self.search(s));
        let mut tracks = Vec::with_capacity(suggestions.len());
        for result in join_all(lookups).await {
            if let Some(track) = result? {
                tracks.push(track);
            }
        }

        log::info!("Resolved {} of {} suggestions", tracks.len(), suggestions.len());
        Ok(tracks)
    }

    async fn search(&self, suggestion: &Suggestion) -> Result<Option<RecommendedTrack>, RecommendError> {
        let query = format!("track:{} artist:{}", suggestion.track, suggestion.artist);
        let token = self.token.read().clone();

        let response = self
            .http
            .get(format!("{}/search", self.api_base))
            .query(&[("q", query.as_str()), ("type", "track"), ("limit", "1")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(CommandError::from)?;

        if response.status().as_u16() == 401 {
            log::warn!("Search rejected the access token");
            return Err(RecommendError::SessionExpired);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await.into());
        }

        let page: SearchResponse = response.json().await.map_err(CommandError::from)?;
        Ok(page.tracks.items.first().and_then(RecommendedTrack::from_raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_every_criterion() {
        let request = MoodRequest::new(Mood::Sad)
            .with_mood_intensity(80)
            .with_style(Style::Dark, 70)
            .with_rhythm(Rhythm::Slow, 20);
        let prompt = request.prompt();

        assert!(prompt.starts_with("Please recommend 12 tracks"));
        assert!(prompt.contains("- Mood: sad, Intensity: 80%"));
        assert!(prompt.contains("- Style: dark, Intensity: 70%"));
        assert!(prompt.contains("- Rhythm: slow, Intensity: 20%"));
        assert!(prompt.contains("darker and more atmospheric"));
        assert!(prompt.contains("slower tempo and more relaxed"));
        assert!(!prompt.contains("DO NOT include"));
    }

    #[test]
    fn test_prompt_lists_previous_tracks() {
        let request = MoodRequest::new(Mood::Happy).excluding(vec![PreviousTrack {
            name: "Walking on Sunshine".into(),
            artists: vec!["Katrina and the Waves".into()],
        }]);
        let prompt = request.prompt();

        assert!(prompt.contains("Please DO NOT include these previously recommended songs"));
        assert!(prompt.contains("Walking on Sunshine"));
        assert!(prompt.contains("brighter and more uplifting"));
    }

    #[test]
    fn test_intensities_are_clamped() {
        let request = MoodRequest::new(Mood::Happy).with_mood_intensity(250);
        assert_eq!(request.mood_intensity, 100);
    }

    #[test]
    fn test_choice_parsing() {
        assert_eq!("Happy".parse::<Mood>(), Ok(Mood::Happy));
        assert_eq!(" dark ".parse::<Style>(), Ok(Style::Dark));
        assert!("angry".parse::<Mood>().is_err());
    }

    #[test]
    fn test_intensity_bands() {
        assert_eq!(IntensityBand::of(0), IntensityBand::Low);
        assert_eq!(IntensityBand::of(32), IntensityBand::Low);
        assert_eq!(IntensityBand::of(33), IntensityBand::Medium);
        assert_eq!(IntensityBand::of(65), IntensityBand::Medium);
        assert_eq!(IntensityBand::of(66), IntensityBand::High);

        let request = MoodRequest::new(Mood::Sad).with_mood_intensity(40);
        assert_eq!(request.mood_band().to_string(), "medium");
        assert_eq!(MoodRequest::new(Mood::Happy).mood_band(), IntensityBand::High);
    }

    #[test]
    fn test_parse_suggestions() {
        let plain = r#"{"tracks":[{"track":"Happy","artist":"Pharrell Williams"}]}"#;
        assert_eq!(
            parse_suggestions(plain).unwrap(),
            vec![Suggestion {
                track: "Happy".into(),
                artist: "Pharrell Williams".into()
            }]
        );

        let fenced = format!("```json\n{}\n```", plain);
        assert_eq!(parse_suggestions(&fenced).unwrap().len(), 1);

        assert!(matches!(
            parse_suggestions("Sure! Here are some songs"),
            Err(RecommendError::InvalidResponse)
        ));
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(RecommendError::MissingApiKey.status(), 401);
        assert_eq!(RecommendError::InsufficientCredits.status(), 402);
        assert_eq!(RecommendError::RateLimited.status(), 429);
        assert_eq!(RecommendError::InvalidResponse.status(), 500);
        assert_eq!(
            RecommendError::Api {
                status: 418,
                message: "teapot".into()
            }
            .status(),
            418
        );
    }

    #[test]
    fn test_history_of() {
        let tracks = vec![RecommendedTrack {
            uri: "spotify:track:1".into(),
            preview_url: None,
            metadata: TrackMetadata {
                id: "1".into(),
                name: "Song".into(),
                artist_names: vec!["A".into(), "B".into()],
                album_art_url: None,
            },
        }];
        assert_eq!(
            history_of(&tracks),
            vec![PreviousTrack {
                name: "Song".into(),
                artists: vec!["A".into(), "B".into()]
            }]
        );
    }
}
