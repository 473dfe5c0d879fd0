//! Feed Authorization Client
//!
//! One-shot exchange of a bearer credential for the authorized stream
//! endpoint. The credential is assumed invalid or expired on failure and
//! must be refreshed externally; nothing here retries.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_AUTHORIZE_URL: &str =
    "https://api.upstox.com/v3/feed/market-data-feed/authorize";

/// Response envelope from the authorize endpoint.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthorizeResponse {
    #[serde(default)]
    pub data: Option<AuthorizeData>,
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthorizeData {
    #[serde(default)]
    pub authorized_redirect_uri: Option<String>,
}

/// Credential exchange failures. Fatal to pipeline startup; never retried
/// internally.
#[derive(Debug)]
pub enum AuthError {
    Request(reqwest::Error),
    Status { status: u16, body: String },
    MissingRedirect { diagnostics: Option<String> },
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request(e) => write!(f, "authorize request failed: {}", e),
            Self::Status { status, body } => {
                write!(f, "authorize returned HTTP {}: {}", status, body)
            }
            Self::MissingRedirect { diagnostics } => match diagnostics {
                Some(d) => write!(f, "authorize response missing redirect uri: {}", d),
                None => write!(f, "authorize response missing redirect uri"),
            },
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(e) => Some(e),
            _ => None,
        }
    }
}

/// Client for the feed authorize endpoint.
#[derive(Clone)]
pub struct FeedAuthClient {
    client: Client,
    authorize_url: String,
}

impl FeedAuthClient {
    pub fn new(access_token: &str) -> Result<Self> {
        Self::with_url(access_token, DEFAULT_AUTHORIZE_URL)
    }

    pub fn with_url(access_token: &str, authorize_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::ACCEPT,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", access_token)
                        .parse()
                        .context("Invalid access token for Authorization header")?,
                );
                headers
            })
            .build()
            .context("Failed to build FeedAuthClient")?;

        Ok(Self {
            client,
            authorize_url: authorize_url.to_string(),
        })
    }

    /// Exchange the bearer credential for the stream endpoint URL.
    pub async fn authorize(&self) -> Result<String, AuthError> {
        let resp = self
            .client
            .get(&self.authorize_url)
            .send()
            .await
            .map_err(AuthError::Request)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: AuthorizeResponse = resp.json().await.map_err(AuthError::Request)?;

        match envelope.data.and_then(|d| d.authorized_redirect_uri) {
            Some(uri) => {
                debug!("feed authorize succeeded");
                Ok(uri)
            }
            None => Err(AuthError::MissingRedirect {
                diagnostics: envelope.errors.map(|e| e.to_string()),
            }),
        }
    }
}
