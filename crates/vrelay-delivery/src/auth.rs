//! Refresh-token exchange.
//!
//! Bearer tokens are short-lived, so one is minted for every upload attempt
//! and never cached across attempts.

use std::fmt;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::{DeliveryError, DeliveryResult};

/// Secure token endpoint used when `TOKEN_ENDPOINT` is unset.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://securetoken.googleapis.com/v1/token";

/// Token exchange configuration.
#[derive(Clone)]
pub struct AuthConfig {
    pub api_key: String,
    pub token_endpoint: String,
    pub timeout: Duration,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("api_key", &"[redacted]")
            .field("token_endpoint", &self.token_endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AuthConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    /// Create config from environment variables.
    ///
    /// `FIREBASE_API_KEY` is required; `TOKEN_ENDPOINT` overrides the default.
    pub fn from_env() -> DeliveryResult<Self> {
        let api_key = std::env::var("FIREBASE_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| DeliveryError::Config("FIREBASE_API_KEY is not set".to_string()))?;

        let mut config = Self::new(api_key);
        if let Ok(endpoint) = std::env::var("TOKEN_ENDPOINT") {
            config.token_endpoint = endpoint;
        }
        Ok(config)
    }
}

/// A freshly minted bearer token.
#[derive(Clone)]
pub struct AuthSession {
    bearer: String,
    expires_in: Option<Duration>,
}

impl AuthSession {
    pub fn bearer(&self) -> &str {
        &self.bearer
    }

    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_in
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("bearer", &"[redacted]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
    /// Seconds; the endpoint sends it as a string
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

fn parse_expires_in(value: &serde_json::Value) -> Option<Duration> {
    match value {
        serde_json::Value::String(s) => s.parse().ok().map(Duration::from_secs),
        serde_json::Value::Number(n) => n.as_u64().map(Duration::from_secs),
        _ => None,
    }
}

/// Exchanges refresh tokens for bearer tokens.
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: Client,
    config: AuthConfig,
}

impl AuthClient {
    pub fn new(config: AuthConfig) -> DeliveryResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(DeliveryError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> DeliveryResult<Self> {
        Self::new(AuthConfig::from_env()?)
    }

    /// Exchange a refresh token for a new bearer token.
    pub async fn exchange(&self, refresh_token: &str) -> DeliveryResult<AuthSession> {
        if refresh_token.trim().is_empty() {
            return Err(DeliveryError::MissingCredential(
                "refresh token is empty".to_string(),
            ));
        }

        let response = self
            .http
            .post(&self.config.token_endpoint)
            .query(&[("key", self.config.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::from_status(status.as_u16(), body));
        }

        let token: TokenResponse = response.json().await?;
        let bearer = token
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DeliveryError::InvalidResponse("token response has no id_token".into()))?;
        let expires_in = token.expires_in.as_ref().and_then(parse_expires_in);

        debug!(expires_in_secs = expires_in.map(|d| d.as_secs()), "Exchanged refresh token");
        Ok(AuthSession { bearer, expires_in })
    }
}
