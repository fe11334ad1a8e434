//! Bearer-token providers for the Graph drive source
//!
//! Providers are plain values owned by whoever builds the source; there is no
//! process-wide token cache.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ImportError;

/// Refresh this long before the token actually expires
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

pub const DEFAULT_TOKEN_URL: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";
pub const DEFAULT_SCOPE: &str = "Files.Read Files.Read.All offline_access";

/// Supplies access tokens for outgoing requests
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, ImportError>;

    /// Drop any cached token so the next call fetches a fresh one
    async fn invalidate(&self) {}

    fn name(&self) -> &'static str;
}

/// A fixed token, e.g. from `GRAPH_ACCESS_TOKEN`
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn access_token(&self) -> Result<String, ImportError> {
        if self.token.trim().is_empty() {
            return Err(ImportError::SourceUnavailable("no access token configured".into()));
        }
        Ok(self.token.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

struct RefreshState {
    refresh_token: String,
    cached: Option<CachedToken>,
}

/// OAuth refresh-token grant, caching the access token until shortly before expiry
pub struct RefreshTokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    scope: String,
    state: Mutex<RefreshState>,
}

impl RefreshTokenProvider {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            scope: DEFAULT_SCOPE.to_string(),
            state: Mutex::new(RefreshState {
                refresh_token: refresh_token.into(),
                cached: None,
            }),
        }
    }

    async fn redeem(&self, refresh_token: &str) -> Result<TokenResponse, ImportError> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ImportError::SourceUnavailable(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImportError::SourceUnavailable(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ImportError::SourceUnavailable(format!("invalid token response: {}", e)))
    }
}

#[async_trait]
impl CredentialProvider for RefreshTokenProvider {
    async fn access_token(&self) -> Result<String, ImportError> {
        let mut state = self.state.lock().await;

        if let Some(cached) = &state.cached {
            if Instant::now() + EXPIRY_MARGIN < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
            debug!("Access token about to expire, refreshing");
        }

        let token = self.redeem(&state.refresh_token).await?;
        if let Some(rotated) = token.refresh_token {
            state.refresh_token = rotated;
        }
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        info!("Acquired Graph access token (valid {}s)", lifetime.as_secs());

        state.cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn invalidate(&self) {
        self.state.lock().await.cached = None;
    }

    fn name(&self) -> &'static str {
        "refresh_token"
    }
}
