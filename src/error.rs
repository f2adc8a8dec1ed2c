// Error handling module
// Credential lifecycle errors and API-call errors

use thiserror::Error;

use crate::auth::StoreError;

/// Errors surfaced by token providers.
///
/// `Clone` so one refresh outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential was ever stored
    #[error("No stored credential found; log in first")]
    NotFound,

    /// Stored credential cannot be read
    #[error("Stored credential is unreadable: {0}")]
    Corrupt(String),

    /// Credential carries no refresh secret
    #[error("Credential has no refresh token; re-authenticate")]
    NoRefreshToken,

    /// Static credential, refresh is not supported at all
    #[error("Static credential cannot be refreshed; re-authenticate manually")]
    NoRefreshCapability,

    /// Refresh secret was rejected; a new login is required
    #[error("Credential is no longer valid: {0}")]
    CredentialInvalid(String),

    /// Network or server trouble during refresh; retry later
    #[error("Token refresh failed: {0}")]
    TransientRefreshFailure(String),

    /// Store I/O failed outside of load classification
    #[error("Credential storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// The user has to log in again before anything can succeed
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::NotFound
                | AuthError::Corrupt(_)
                | AuthError::NoRefreshToken
                | AuthError::NoRefreshCapability
                | AuthError::CredentialInvalid(_)
        )
    }

    /// Retrying the whole operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthError::TransientRefreshFailure(_) | AuthError::Storage(_)
        )
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AuthError::NotFound,
            StoreError::Corrupt(msg) => AuthError::Corrupt(msg),
            other => AuthError::Storage(other.to_string()),
        }
    }
}

/// Errors from authenticated API calls
#[derive(Error, Debug)]
pub enum ApiError {
    /// Token could not be obtained or refreshed
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Remote API answered with an error status
    #[error("API error: {status} - {message}")]
    Status { status: u16, message: String },

    /// Transport failure after all retries
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
