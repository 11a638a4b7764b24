use anyhow::Context as _;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cloud::CloudClient;

/// Interface of the authentication collaborator.
///
/// The capture core only ever calls these four operations; how tokens are
/// provisioned in the first place is not its concern.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Called once at startup. Failure is fatal for the daemon.
    async fn authenticate(&self) -> anyhow::Result<()>;

    async fn get_token(&self) -> Option<String>;

    /// Attempts a bearer refresh; returns whether a fresh token is in place.
    async fn refresh_token(&self) -> bool;

    async fn get_account_id(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct TokenCache {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshGrantResponse {
    access_token: String,
    refresh_token: Option<String>,
}

/// Authentication backed by the cloud OAuth endpoint and an on-disk token
/// cache, with the account id cached alongside it.
pub struct CloudAuth {
    cloud: CloudClient,
    http: reqwest::Client,
    oauth_url: Url,
    token_cache_path: Utf8PathBuf,
    account_id_cache_path: Utf8PathBuf,
    tokens: Mutex<TokenCache>,
    account_id: Mutex<Option<String>>,
}

impl CloudAuth {
    pub fn new(cloud: CloudClient, oauth_url: Url, token_cache_path: Utf8PathBuf) -> Self {
        let account_id_cache_path = token_cache_path
            .parent()
            .unwrap_or(Utf8Path::new("."))
            .join("account_id");

        Self {
            cloud,
            http: reqwest::Client::new(),
            oauth_url,
            token_cache_path,
            account_id_cache_path,
            tokens: Mutex::new(TokenCache::default()),
            account_id: Mutex::new(None),
        }
    }

    async fn load_token_cache(&self) -> anyhow::Result<TokenCache> {
        let contents = tokio::fs::read(&self.token_cache_path)
            .await
            .with_context(|| format!("couldn't read token cache at {}", self.token_cache_path))?;

        serde_json::from_slice(&contents)
            .with_context(|| format!("invalid token cache at {}", self.token_cache_path))
    }

    async fn persist_token_cache(&self, cache: &TokenCache) {
        let json = match serde_json::to_vec_pretty(cache) {
            Ok(json) => json,
            Err(error) => {
                warn!(%error, "Failed to serialize the token cache");
                return;
            }
        };

        if let Err(error) = tokio::fs::write(&self.token_cache_path, json).await {
            warn!(%error, path = %self.token_cache_path, "Failed to persist the token cache");
        }
    }

    async fn request_refresh_grant(&self, refresh_token: &str) -> anyhow::Result<RefreshGrantResponse> {
        let response = self
            .http
            .post(self.oauth_url.clone())
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await
            .context("refresh grant request failed")?
            .error_for_status()
            .context("refresh grant rejected")?;

        response.json().await.context("malformed refresh grant response")
    }
}

#[async_trait]
impl AuthProvider for CloudAuth {
    async fn authenticate(&self) -> anyhow::Result<()> {
        let cache = self.load_token_cache().await?;

        anyhow::ensure!(
            cache.access_token.is_some() || cache.refresh_token.is_some(),
            "token cache at {} holds no usable token",
            self.token_cache_path
        );

        *self.tokens.lock() = cache;

        // A cached access token may be long expired; trade the refresh token
        // for a fresh one right away when we can.
        let has_refresh_token = self.tokens.lock().refresh_token.is_some();
        if has_refresh_token && !self.refresh_token().await {
            anyhow::ensure!(
                self.tokens.lock().access_token.is_some(),
                "bearer refresh failed and no access token is cached"
            );
        }

        // Warm the account id cache.
        if let Ok(path) = tokio::fs::read_to_string(&self.account_id_cache_path).await {
            let cached = path.trim();
            if !cached.is_empty() {
                *self.account_id.lock() = Some(cached.to_owned());
            }
        }

        info!("Authenticated against the cloud API");

        Ok(())
    }

    async fn get_token(&self) -> Option<String> {
        self.tokens.lock().access_token.clone()
    }

    async fn refresh_token(&self) -> bool {
        let refresh_token = match self.tokens.lock().refresh_token.clone() {
            Some(token) => token,
            None => {
                debug!("No refresh token available");
                return false;
            }
        };

        match self.request_refresh_grant(&refresh_token).await {
            Ok(grant) => {
                let cache = {
                    let mut tokens = self.tokens.lock();
                    tokens.access_token = Some(grant.access_token);
                    if let Some(refreshed) = grant.refresh_token {
                        tokens.refresh_token = Some(refreshed);
                    }
                    tokens.clone()
                };

                self.persist_token_cache(&cache).await;

                debug!("Bearer token refreshed");

                true
            }
            Err(error) => {
                warn!(error = format!("{error:#}"), "Bearer token refresh failed");
                false
            }
        }
    }

    async fn get_account_id(&self) -> anyhow::Result<String> {
        if let Some(account_id) = self.account_id.lock().clone() {
            return Ok(account_id);
        }

        let bearer = self
            .get_token()
            .await
            .context("no bearer token available for account discovery")?;

        let account_id = self
            .cloud
            .discover_account_id(&bearer)
            .await
            .context("devices listing failed")?
            .context("no account id found in the devices listing")?;

        *self.account_id.lock() = Some(account_id.clone());

        if let Err(error) = tokio::fs::write(&self.account_id_cache_path, &account_id).await {
            debug!(%error, "Couldn't cache the account id on disk");
        }

        info!(account.id = %account_id, "Discovered account id");

        Ok(account_id)
    }
}
