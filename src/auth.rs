//! Credential loading for the agent endpoint.
//!
//! Two sources are supported: a token acquired out of band (for example with
//! `az account get-access-token`) and the OAuth2 client-credentials grant
//! against the Microsoft identity platform. Tokens from the latter are cached
//! until shortly before they expire.

use std::{fmt, sync::Arc, time::Duration as StdDuration};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::IdentitySettings;

const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity provider rejected the request: {error}: {description}")]
    Rejected { error: String, description: String },
    #[error("unexpected token endpoint response ({status}): {body}")]
    InvalidResponse { status: u16, body: String },
    #[error("incomplete identity settings: {0}")]
    Incomplete(&'static str),
}

#[derive(Clone, PartialEq)]
pub struct AccessToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Tokens without an expiry are assumed valid for the whole run.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::seconds(REFRESH_MARGIN_SECS) < expires_at,
            None => true,
        }
    }
}

#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn token(&self) -> Result<AccessToken, AuthError>;

    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct StaticTokenCredential {
    token: AccessToken,
}

impl StaticTokenCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            token: AccessToken::new(secret, None),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        Ok(self.token.clone())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

pub struct ClientSecretCredential {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: Mutex<Option<AccessToken>>,
}

impl fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

impl ClientSecretCredential {
    pub fn new(
        authority_host: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: impl Into<String>,
        request_timeout: StdDuration,
    ) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority_host.trim_end_matches('/'),
                tenant_id
            ),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: scope.into(),
            cache: Mutex::new(None),
        })
    }

    async fn request_token(&self) -> Result<AccessToken, AuthError> {
        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<TokenErrorResponse>(&body) {
                return Err(AuthError::Rejected {
                    error: error.error,
                    description: error.error_description,
                });
            }
            return Err(AuthError::InvalidResponse {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|_| AuthError::InvalidResponse {
                status: status.as_u16(),
                body: body.clone(),
            })?;

        let expires_at = parsed
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds));
        Ok(AccessToken::new(parsed.access_token, expires_at))
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if token.is_fresh_at(Utc::now()) {
                return Ok(token.clone());
            }
        }

        tracing::debug!(client_id = %self.client_id, scope = %self.scope, "requesting access token");
        let token = self.request_token().await?;
        *cache = Some(token.clone());
        Ok(token)
    }

    fn kind(&self) -> &'static str {
        "client-secret"
    }
}

/// Builds the credential described by the settings. A pre-acquired token wins
/// over the app registration. `default_scope` is used when the settings do
/// not name one.
pub fn credential_from_settings(
    settings: &IdentitySettings,
    default_scope: &str,
) -> Result<Arc<dyn TokenCredential>, AuthError> {
    if let Some(token) = &settings.access_token {
        return Ok(Arc::new(StaticTokenCredential::new(token.clone())));
    }

    let tenant_id = settings
        .tenant_id
        .as_deref()
        .ok_or(AuthError::Incomplete("TENANT_ID"))?;
    let client_id = settings
        .client_id
        .clone()
        .ok_or(AuthError::Incomplete("APP_CLIENT_ID"))?;
    let client_secret = settings
        .client_secret
        .clone()
        .ok_or(AuthError::Incomplete("APP_CLIENT_SECRET"))?;
    let scope = settings
        .scope
        .clone()
        .unwrap_or_else(|| default_scope.to_string());

    Ok(Arc::new(ClientSecretCredential::new(
        &settings.authority_host,
        tenant_id,
        client_id,
        client_secret,
        scope,
        settings.request_timeout,
    )?))
}
