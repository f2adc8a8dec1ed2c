// Token providers: the surface API callers use

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

use super::refresh::TokenEndpoint;
use super::refresher::{Refresher, RefresherSettings};
use super::sanitize::sanitize;
use super::store::TokenStore;
use super::types::TokenRecord;
use crate::error::AuthError;

/// Supplies bearer tokens to outbound API calls.
///
/// Call `get_token` before attaching a credential to a request. After the
/// request fails authentication, call `refresh_if_needed` exactly once with
/// the token that was rejected, then retry once with the returned token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<String, AuthError>;

    async fn refresh_if_needed(&self, failed_token: &str) -> Result<String, AuthError>;
}

/// Fixed, non-refreshable credential
pub struct StaticProvider {
    token: SecretString,
}

impl StaticProvider {
    pub fn new(record: TokenRecord) -> Self {
        Self {
            token: SecretString::new(record.value().to_string()),
        }
    }

    /// `None` if the value is empty after sanitization
    pub fn from_token(token: &str) -> Option<Self> {
        TokenRecord::new(token).map(Self::new)
    }
}

#[async_trait]
impl TokenProvider for StaticProvider {
    async fn get_token(&self) -> Result<String, AuthError> {
        Ok(sanitize(self.token.expose_secret()))
    }

    async fn refresh_if_needed(&self, _failed_token: &str) -> Result<String, AuthError> {
        tracing::warn!("Static credential was rejected; re-authentication required");
        Err(AuthError::NoRefreshCapability)
    }
}

/// Provider backed by a shared [`Refresher`]
#[derive(Clone)]
pub struct RefreshingProvider {
    refresher: Refresher,
}

impl RefreshingProvider {
    pub fn new(refresher: Refresher) -> Self {
        Self { refresher }
    }
}

#[async_trait]
impl TokenProvider for RefreshingProvider {
    async fn get_token(&self) -> Result<String, AuthError> {
        self.refresher.get_valid_token().await.map(|t| sanitize(&t))
    }

    async fn refresh_if_needed(&self, failed_token: &str) -> Result<String, AuthError> {
        self.refresher
            .refresh_if_needed(failed_token)
            .await
            .map(|t| sanitize(&t))
    }
}

/// Pick the provider for a loaded credential: refreshing when it carries a
/// refresh secret, static otherwise
pub fn build_provider(
    record: TokenRecord,
    store: Arc<dyn TokenStore>,
    endpoint: Option<Arc<dyn TokenEndpoint>>,
    settings: RefresherSettings,
) -> Arc<dyn TokenProvider> {
    match endpoint {
        Some(endpoint) if record.has_refresh_secret() => {
            tracing::debug!("Using refreshing token provider");
            Arc::new(RefreshingProvider::new(Refresher::with_settings(
                record, store, endpoint, settings,
            )))
        }
        Some(_) => {
            tracing::debug!("Credential has no refresh token, using static provider");
            Arc::new(StaticProvider::new(record))
        }
        None => {
            if record.has_refresh_secret() {
                tracing::warn!("No token endpoint configured; credential will not be refreshed");
            }
            Arc::new(StaticProvider::new(record))
        }
    }
}
