//! OAuth access token provider with automatic refresh.
//!
//! Either a static bearer token, or an authorized-user credentials file whose
//! refresh token is exchanged for access tokens as they expire. Refreshed
//! tokens are written back to the file so the next run can reuse them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Google's OAuth2 token endpoint.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Authorized-user credentials, as written by Google's installed-app flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// Last issued access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
}

impl AuthorizedUser {
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Cannot read credentials file {}: {}", path.display(), e)
        })?;
        let user: AuthorizedUser = serde_json::from_str(&raw).map_err(|e| {
            anyhow::anyhow!("Invalid credentials file {}: {}", path.display(), e)
        })?;
        Ok(user)
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }
}

/// Cached token with expiration.
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now() >= exp - Duration::minutes(5),
            // No expiration info: refresh.
            None => true,
        }
    }
}

enum Mode {
    Static(String),
    Refreshing {
        user: Mutex<AuthorizedUser>,
        cache: Mutex<Option<CachedToken>>,
        persist_to: Option<PathBuf>,
    },
}

/// Resolves a valid access token for Drive calls.
pub struct TokenProvider {
    http: reqwest::Client,
    mode: Mode,
}

impl TokenProvider {
    /// Provider for a fixed bearer token. It is never refreshed.
    pub fn fixed(access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            mode: Mode::Static(access_token.into()),
        }
    }

    /// Provider refreshing through `user`'s refresh token. When `persist_to`
    /// is set, refreshed tokens are written back to that file.
    pub fn authorized_user(user: AuthorizedUser, persist_to: Option<PathBuf>) -> Self {
        let cached = user.token.clone().map(|access_token| CachedToken {
            access_token,
            expires_at: user.expiry,
        });
        Self {
            http: reqwest::Client::new(),
            mode: Mode::Refreshing {
                user: Mutex::new(user),
                cache: Mutex::new(cached),
                persist_to,
            },
        }
    }

    /// Load an authorized-user credentials file and refresh through it.
    pub async fn from_credentials_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let user = AuthorizedUser::from_file(&path).await?;
        Ok(Self::authorized_user(user, Some(path)))
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn access_token(&self) -> anyhow::Result<String> {
        let (user, cache, persist_to) = match &self.mode {
            Mode::Static(token) => return Ok(token.clone()),
            Mode::Refreshing {
                user,
                cache,
                persist_to,
            } => (user, cache, persist_to),
        };

        // Holding the cache lock across the refresh keeps concurrent callers
        // from refreshing twice.
        let mut cached = cache.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.is_expired() {
                debug!("Token cache hit");
                return Ok(token.access_token.clone());
            }
            debug!("Access token expired, refreshing");
        }

        let mut user = user.lock().await;
        let fresh = self.refresh(&user).await?;

        // Google may rotate the refresh token
        if let Some(rotated) = fresh.refresh_token {
            user.refresh_token = rotated;
        }
        let expires_at = Utc::now() + Duration::seconds(fresh.expires_in as i64);
        user.token = Some(fresh.access_token.clone());
        user.expiry = Some(expires_at);

        if let Some(path) = persist_to {
            if let Err(e) = persist(path, &user).await {
                warn!("Failed to save refreshed token to {}: {}", path.display(), e);
            }
        }

        *cached = Some(CachedToken {
            access_token: fresh.access_token.clone(),
            expires_at: Some(expires_at),
        });

        info!("Refreshed OAuth token, expires at {}", expires_at.to_rfc3339());
        Ok(fresh.access_token)
    }

    /// Exchange the refresh token for a new access token.
    async fn refresh(&self, user: &AuthorizedUser) -> anyhow::Result<RefreshResponse> {
        let resp = self
            .http
            .post(user.token_uri())
            .form(&[
                ("client_id", user.client_id.as_str()),
                ("client_secret", user.client_secret.as_str()),
                ("refresh_token", user.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("OAuth token refresh failed: {} {}", status, body);
        }

        Ok(resp.json().await?)
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: u64,
    refresh_token: Option<String>,
}

async fn persist(path: &Path, user: &AuthorizedUser) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(user)?;
    let temp = path.with_extension("json.tmp");
    tokio::fs::write(&temp, json).await?;
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}
