//! Access tokens for embedding providers.
//!
//! Providers authenticate in one of three ways:
//!
//! | `auth.type` | Token |
//! |-------------|-------|
//! | `none` | no `Authorization` header |
//! | `static` | API key read from an environment variable |
//! | `oauth` | bearer token from a client-credentials endpoint, cached until shortly before expiry |
//!
//! OAuth tokens live in a [`TtlStore`] keyed by provider id, so every job
//! handled by the same worker reuses one token until it is about to expire.

use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AuthConfig, ProviderConfig};
use crate::db::now_ms;
use crate::error::{transport_message, TokenError};
use crate::ttl_store::TtlStore;

/// Tokens are dropped this long before their advertised expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
/// Lifetime assumed when the token endpoint does not advertise one.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(25 * 60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Epoch millis.
    #[serde(default)]
    expires_at: Option<i64>,
    /// Seconds.
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct TokenService {
    client: reqwest::Client,
    cache: Arc<TtlStore<String, String>>,
}

impl TokenService {
    pub fn new(cache: Arc<TtlStore<String, String>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<TtlStore<String, String>> {
        &self.cache
    }

    /// Whether credentials for the provider can be resolved at all, without
    /// performing any network call.
    pub fn credentials_available(provider: &ProviderConfig) -> Result<(), TokenError> {
        match &provider.auth {
            AuthConfig::None => Ok(()),
            AuthConfig::Static { api_key_env } => read_env(provider, api_key_env).map(|_| ()),
            AuthConfig::OAuth {
                credentials_env, ..
            } => read_env(provider, credentials_env).map(|_| ()),
        }
    }

    /// Bearer token for `provider`, or `None` when it needs no auth.
    pub async fn access_token(
        &self,
        provider: &ProviderConfig,
    ) -> Result<Option<String>, TokenError> {
        match &provider.auth {
            AuthConfig::None => Ok(None),
            AuthConfig::Static { api_key_env } => read_env(provider, api_key_env).map(Some),
            AuthConfig::OAuth {
                token_url,
                credentials_env,
                scope,
            } => {
                if let Some(token) = self.cache.get(&provider.id) {
                    return Ok(Some(token));
                }
                let credentials = read_env(provider, credentials_env)?;
                let (token, ttl) = self
                    .fetch_oauth_token(token_url, &credentials, scope.as_deref(), provider)
                    .await?;
                self.cache.insert(provider.id.clone(), token.clone(), ttl);
                tracing::debug!(provider = %provider.id, ttl_secs = ttl.as_secs(), "access token refreshed");
                Ok(Some(token))
            }
        }
    }

    /// Forget the cached token, e.g. after the provider rejected it.
    pub fn invalidate(&self, provider_id: &str) {
        self.cache.remove(&provider_id.to_string());
    }

    async fn fetch_oauth_token(
        &self,
        token_url: &str,
        credentials: &str,
        scope: Option<&str>,
        provider: &ProviderConfig,
    ) -> Result<(String, Duration), TokenError> {
        let form: Vec<(&str, &str)> = scope.map(|scope| ("scope", scope)).into_iter().collect();

        let resp = self
            .client
            .post(token_url)
            .timeout(Duration::from_secs(provider.timeout_secs))
            .header("Authorization", format!("Basic {}", basic_credentials(credentials)))
            .header("RqUID", uuid::Uuid::new_v4().to_string())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| match transport_message(&e) {
                Some(msg) => TokenError::Transport(msg),
                None => TokenError::InvalidResponse(e.to_string()),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TokenError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| TokenError::InvalidResponse(e.to_string()))?;

        if parsed.access_token.is_empty() {
            return Err(TokenError::InvalidResponse("empty access_token".into()));
        }

        let lifetime = match (parsed.expires_at, parsed.expires_in) {
            (Some(at), _) => Duration::from_millis(at.saturating_sub(now_ms()).max(0) as u64),
            (None, Some(secs)) => Duration::from_secs(secs),
            (None, None) => DEFAULT_TOKEN_TTL,
        };

        Ok((parsed.access_token, lifetime.saturating_sub(EXPIRY_MARGIN)))
    }
}

fn read_env(provider: &ProviderConfig, var: &str) -> Result<String, TokenError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(TokenError::MissingCredentials {
            provider: provider.id.clone(),
            reason: format!("environment variable {} is not set", var),
        }),
    }
}

/// `client_id:secret` pairs are encoded; anything else is taken to be an
/// already-encoded authorization key.
fn basic_credentials(credentials: &str) -> String {
    if credentials.contains(':') {
        base64::engine::general_purpose::STANDARD.encode(credentials)
    } else {
        credentials.to_string()
    }
}
