//! Credential loading and on-demand OAuth token refresh.
//!
//! The broker is the single path from "I need to call provider P for
//! user U" to a usable access token. A token within `skew` of expiry is
//! refreshed first; a failed refresh marks the credential revoked so
//! every dependent workflow fails fast with a reconnect-required error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use super::{classify_status, ConnectorError};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::store::Store;
use crate::types::{Provider, ProviderCredential, UserId};

/// Default refresh skew: tokens expiring within this window are renewed
/// before use.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(300);

/// Result of a token refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    /// New access token.
    pub access_token: String,
    /// Replacement refresh token, when the provider rotates them.
    pub refresh_token: Option<String>,
    /// Seconds until the new token expires.
    pub expires_in: Option<u64>,
}

/// Exchange a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Perform the refresh grant.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Auth`] when the provider rejects the
    /// refresh token (the credential is dead), other variants for
    /// retryable transport problems.
    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ConnectorError>;
}

/// OAuth refresh-grant client (`POST {token_url}` form-encoded).
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    token_url: String,
    client_id: String,
    client_secret: String,
    client: reqwest::Client,
}

impl HttpTokenRefresher {
    /// Create a refresher against the given token endpoint.
    pub fn new(token_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            token_url: token_url.to_owned(),
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ConnectorError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ConnectorError::Transient(format!("refresh request failed: {e}")))?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| ConnectorError::Transient(format!("body read failed: {e}")))?;
        if !status.is_success() {
            // Providers answer a dead refresh token with 400/401.
            let err = classify_status(status.as_u16(), &payload);
            return Err(match err {
                ConnectorError::InvalidRequest(msg) => ConnectorError::Auth(msg),
                other => other,
            });
        }

        let grant: TokenGrant = serde_json::from_str(&payload)
            .map_err(|e| ConnectorError::Parse(format!("bad token response: {e}")))?;
        info!(provider = provider.as_str(), "access token refreshed");
        Ok(grant)
    }
}

/// Loads credentials and keeps their access tokens fresh.
pub struct CredentialBroker {
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    skew: Duration,
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("skew", &self.skew)
            .finish_non_exhaustive()
    }
}

impl CredentialBroker {
    /// Create a broker with the default refresh skew.
    pub fn new(refresher: Arc<dyn TokenRefresher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            refresher,
            clock,
            skew: DEFAULT_REFRESH_SKEW,
        }
    }

    /// Load the credential for `(user, provider)`, refreshing if it is
    /// within the skew of expiry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuthRequired`] when the credential is missing,
    /// already revoked, or the refresh fails terminally (the row is then
    /// marked revoked). Transport problems during refresh surface as
    /// `Transient`.
    pub async fn fresh_credential(
        &self,
        store: &Store,
        user: &UserId,
        provider: Provider,
    ) -> Result<ProviderCredential, CoreError> {
        let credential = store
            .credential(user, provider)
            .await?
            .ok_or_else(|| {
                CoreError::AuthRequired(format!(
                    "no {} credential for user {user}; reconnect required",
                    provider.as_str()
                ))
            })?;

        if credential.revoked {
            return Err(CoreError::AuthRequired(format!(
                "{} credential revoked; reconnect required",
                provider.as_str()
            )));
        }

        let now = self.clock.now_utc();
        if !needs_refresh(credential.expires_at, now, self.skew) {
            return Ok(credential);
        }

        let Some(ref refresh_token) = credential.refresh_token else {
            store.mark_credential_revoked(user, provider, now).await?;
            return Err(CoreError::AuthRequired(format!(
                "{} token expired with no refresh token; reconnect required",
                provider.as_str()
            )));
        };

        match self.refresher.refresh(provider, refresh_token).await {
            Ok(grant) => {
                let expires_at = grant.expires_in.and_then(|secs| {
                    now.checked_add_signed(chrono::Duration::seconds(
                        i64::try_from(secs).unwrap_or(i64::MAX),
                    ))
                });
                store
                    .update_credential_tokens(
                        user,
                        provider,
                        &grant.access_token,
                        grant.refresh_token.as_deref(),
                        expires_at,
                        now,
                    )
                    .await?;
                let mut refreshed = credential;
                refreshed.access_token = grant.access_token;
                if let Some(rt) = grant.refresh_token {
                    refreshed.refresh_token = Some(rt);
                }
                refreshed.expires_at = expires_at;
                refreshed.updated_at = now;
                Ok(refreshed)
            }
            Err(ConnectorError::Auth(msg)) => {
                warn!(
                    user = %user,
                    provider = provider.as_str(),
                    error = %msg,
                    "token refresh rejected, marking credential revoked"
                );
                store.mark_credential_revoked(user, provider, now).await?;
                Err(CoreError::AuthRequired(format!(
                    "{} token refresh failed; reconnect required",
                    provider.as_str()
                )))
            }
            Err(other) => Err(other.into()),
        }
    }
}

fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>, skew: Duration) -> bool {
    match expires_at {
        None => false,
        Some(expiry) => {
            let horizon = now
                .checked_add_signed(
                    chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero()),
                )
                .unwrap_or(now);
            expiry <= horizon
        }
    }
}
