//! Spotify login: authorization-code flow against the accounts service.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const SCOPES: &[&str] = &[
    "user-read-email",
    "user-read-private",
    "streaming",
    "user-read-playback-state",
    "user-modify-playback-state",
    "playlist-read-private",
    "playlist-read-collaborative",
    "playlist-modify-public",
    "playlist-modify-private",
];

const TOKEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization code is required")]
    MissingCode,
    #[error("Authorization was denied: {0}")]
    Denied(String),
    #[error("Redirect state does not match the login request")]
    StateMismatch,
    #[error("Invalid redirect URL: {0}")]
    InvalidRedirect(#[from] url::ParseError),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    Server(String),
    #[error("{0}")]
    Rejected(String),
    #[error("Network timeout")]
    Timeout,
    #[error("Token request failed: {0}")]
    Http(reqwest::Error),
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AuthError::Timeout
        } else {
            AuthError::Http(e)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error_description: Option<String>,
}

/// What the accounts service handed back on the redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    pub code: String,
    pub state: Option<String>,
}

impl Callback {
    /// Reject a redirect whose `state` is missing or differs from the one
    /// sent with the authorize URL.
    pub fn verify(&self, expected: &str) -> Result<(), AuthError> {
        match self.state.as_deref() {
            Some(state) if state == expected => Ok(()),
            _ => Err(AuthError::StateMismatch),
        }
    }
}

/// Random value for the `state` parameter.
pub fn new_state() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Pull `code` / `state` out of the redirected URL.
pub fn code_from_redirect(redirect: &str) -> Result<Callback, AuthError> {
    let url = Url::parse(redirect.trim())?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(AuthError::Denied(value.into_owned())),
            _ => {}
        }
    }

    let code = code.filter(|c| !c.trim().is_empty()).ok_or(AuthError::MissingCode)?;
    Ok(Callback { code, state })
}

pub struct SpotifyAuth {
    http: reqwest::Client,
    accounts_base: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl SpotifyAuth {
    pub fn new(
        accounts_base: &str,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder().timeout(TOKEN_TIMEOUT).build()?;
        Ok(Self {
            http,
            accounts_base: accounts_base.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
        })
    }

    pub fn authorize_url(&self, state: &str) -> Result<Url, AuthError> {
        let mut url = Url::parse(&format!("{}/authorize", self.accounts_base))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &SCOPES.join(" "))
            .append_pair("state", state);
        Ok(url)
    }

    fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.client_id, self.client_secret);
        format!("Basic {}", STANDARD.encode(raw))
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenSet, AuthError> {
        let response = self
            .http
            .post(format!("{}/api/token", self.accounts_base))
            .header(reqwest::header::AUTHORIZATION, self.basic_auth())
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<TokenSet>().await?);
        }

        let body: TokenErrorBody = response.json().await.unwrap_or_default();
        log::warn!("Token endpoint answered {}: {:?}", status, body.error_description);

        if status.as_u16() == 429 {
            return Err(AuthError::RateLimited);
        }
        if status.is_server_error() {
            return Err(AuthError::Server(
                body.error_description
                    .unwrap_or_else(|| "Server error occurred".to_string()),
            ));
        }
        Err(AuthError::Rejected(body.error_description.unwrap_or_else(|| {
            format!("Token request failed with status {}", status.as_u16())
        })))
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet, AuthError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AuthError::MissingCode);
        }

        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
        ])
        .await
    }

    /// Refresh an access token. The old refresh token is kept when the
    /// service does not rotate it.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
        let mut tokens = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;

        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> SpotifyAuth {
        SpotifyAuth::new(
            "https://accounts.example.com/",
            "client",
            "secret",
            "http://localhost:3000/auth/spotify/callback",
        )
        .unwrap()
    }

    #[test]
    fn test_authorize_url() {
        let url = auth().authorize_url("xyz").unwrap();
        assert_eq!(url.path(), "/authorize");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".into(), "client".into())));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        assert!(pairs.contains(&("state".into(), "xyz".into())));
        let scope = pairs.iter().find(|(k, _)| k == "scope").unwrap();
        assert!(scope.1.contains("streaming"));
        assert!(scope.1.contains("user-modify-playback-state"));
    }

    #[test]
    fn test_basic_auth_header() {
        // base64("client:secret")
        assert_eq!(auth().basic_auth(), "Basic Y2xpZW50OnNlY3JldA==");
    }

    #[test]
    fn test_code_from_redirect() {
        let callback =
            code_from_redirect("http://localhost:3000/auth/spotify/callback?code=abc&state=s1\n")
                .unwrap();
        assert_eq!(callback.code, "abc");
        assert_eq!(callback.state.as_deref(), Some("s1"));

        assert!(matches!(
            code_from_redirect("http://localhost/cb?error=access_denied"),
            Err(AuthError::Denied(reason)) if reason == "access_denied"
        ));
        assert!(matches!(
            code_from_redirect("http://localhost/cb?state=s1"),
            Err(AuthError::MissingCode)
        ));
    }

    #[test]
    fn test_redirect_state_must_match() {
        let callback = code_from_redirect("http://localhost/cb?code=abc&state=s1").unwrap();
        assert!(callback.verify("s1").is_ok());
        assert!(matches!(callback.verify("s2"), Err(AuthError::StateMismatch)));

        let stateless = code_from_redirect("http://localhost/cb?code=abc").unwrap();
        assert!(matches!(stateless.verify("s1"), Err(AuthError::StateMismatch)));
    }

    #[test]
    fn test_new_state_shape() {
        let state = new_state();
        assert_eq!(state.len(), 16);
        assert!(state.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_empty_code_is_rejected_locally() {
        assert!(matches!(
            auth().exchange_code("  ").await,
            Err(AuthError::MissingCode)
        ));
    }
}
