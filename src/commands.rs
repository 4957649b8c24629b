use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Web API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Web API answered {status}: {message}")]
    Status { status: u16, message: String },
}

/// Remote playback commands against the streaming service's Web API.
#[async_trait]
pub trait PlaybackApi: Send + Sync {
    /// Start `track_uri` on `device_id`.
    async fn play_track(&self, device_id: &str, track_uri: &str) -> Result<(), CommandError>;

    async fn pause(&self, device_id: &str) -> Result<(), CommandError>;
}

/// Bearer token shared between the API clients and the playback handle.
pub type SharedToken = Arc<RwLock<String>>;

pub fn shared_token(token: impl Into<String>) -> SharedToken {
    Arc::new(RwLock::new(token.into()))
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Object { message: String },
    Code(String),
}

/// Turn a non-success response into a `CommandError::Status`, pulling the
/// message out of the usual `{"error": {...}}` envelope when present.
pub(crate) async fn status_error(response: reqwest::Response) -> CommandError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody {
            error: ErrorDetail::Object { message },
        }) => message,
        Ok(ErrorBody {
            error: ErrorDetail::Code(code),
        }) => code,
        Err(_) if !body.is_empty() => body,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };

    CommandError::Status {
        status: status.as_u16(),
        message,
    }
}

#[derive(Clone)]
pub struct WebApiClient {
    http: reqwest::Client,
    api_base: String,
    token: SharedToken,
}

impl WebApiClient {
    pub fn new(api_base: &str, token: SharedToken, timeout: Duration) -> Result<Self, CommandError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, api_base, token))
    }

    pub fn with_client(http: reqwest::Client, api_base: &str, token: SharedToken) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    pub(crate) fn bearer(&self) -> String {
        self.token.read().clone()
    }
}

#[async_trait]
impl PlaybackApi for WebApiClient {
    async fn play_track(&self, device_id: &str, track_uri: &str) -> Result<(), CommandError> {
        log::debug!("Requesting {} on device {}", track_uri, device_id);

        let response = self
            .http
            .put(self.endpoint("me/player/play"))
            .query(&[("device_id", device_id)])
            .bearer_auth(self.bearer())
            .json(&json!({ "uris": [track_uri] }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn pause(&self, device_id: &str) -> Result<(), CommandError> {
        let response = self
            .http
            .put(self.endpoint("me/player/pause"))
            .query(&[("device_id", device_id)])
            .bearer_auth(self.bearer())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_cleanly() {
        let client = WebApiClient::with_client(
            reqwest::Client::new(),
            "https://api.example.com/v1/",
            shared_token("t"),
        );
        assert_eq!(
            client.endpoint("/me/player/play"),
            "https://api.example.com/v1/me/player/play"
        );
    }

    #[test]
    fn test_token_updates_are_visible() {
        let token = shared_token("old");
        let client =
            WebApiClient::with_client(reqwest::Client::new(), "http://localhost", token.clone());
        *token.write() = "new".to_string();
        assert_eq!(client.bearer(), "new");
    }
}
