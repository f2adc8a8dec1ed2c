// Token refresh calls and failure classification

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;
use thiserror::Error;

use super::types::{expiry_after, JsonRefreshRequest, RefreshResponse, TokenData};

/// Why a refresh call did not produce a token
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("refresh timed out")]
    Timeout,

    #[error("token endpoint returned {status}: {body}")]
    Status {
        status: u16,
        /// OAuth `error` field, when the body carried one
        error_code: Option<String>,
        body: String,
    },

    #[error("invalid token endpoint response: {0}")]
    InvalidResponse(String),

    /// The endpoint implementation panicked mid-call
    #[error("token endpoint panicked: {0}")]
    Panicked(String),
}

/// Whether a failed refresh may succeed if tried again later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Decides which refresh failures revoke the session
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, failure: &RefreshFailure) -> FailureKind;
}

impl<F> FailureClassifier for F
where
    F: Fn(&RefreshFailure) -> FailureKind + Send + Sync,
{
    fn classify(&self, failure: &RefreshFailure) -> FailureKind {
        self(failure)
    }
}

/// Status-code based classification.
///
/// Listed statuses and OAuth error codes are permanent; network errors,
/// timeouts, malformed responses and all other statuses are transient.
#[derive(Debug, Clone)]
pub struct StatusClassifier {
    permanent_statuses: Vec<u16>,
    permanent_error_codes: Vec<String>,
}

impl StatusClassifier {
    pub fn new(permanent_statuses: Vec<u16>) -> Self {
        Self {
            permanent_statuses,
            ..Self::default()
        }
    }
}

impl Default for StatusClassifier {
    fn default() -> Self {
        Self {
            permanent_statuses: vec![400, 401, 403],
            permanent_error_codes: ["invalid_grant", "invalid_client", "unauthorized_client"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl FailureClassifier for StatusClassifier {
    fn classify(&self, failure: &RefreshFailure) -> FailureKind {
        match failure {
            RefreshFailure::Status {
                status, error_code, ..
            } => {
                let code_is_permanent = error_code
                    .as_deref()
                    .map(|code| self.permanent_error_codes.iter().any(|c| c == code))
                    .unwrap_or(false);

                if code_is_permanent || self.permanent_statuses.contains(status) {
                    FailureKind::Permanent
                } else {
                    FailureKind::Transient
                }
            }
            RefreshFailure::Network(_)
            | RefreshFailure::Timeout
            | RefreshFailure::InvalidResponse(_)
            | RefreshFailure::Panicked(_) => FailureKind::Transient,
        }
    }
}

/// Remote endpoint that exchanges a refresh secret for a new token
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, refresh_secret: &str) -> Result<TokenData, RefreshFailure>;
}

/// Wire format of the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStyle {
    /// JSON body `{"refreshToken": ...}`, camelCase response
    Json,

    /// RFC 6749 form-encoded `grant_type=refresh_token`
    OAuth,
}

impl FromStr for EndpointStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(EndpointStyle::Json),
            "oauth" | "oauth2" | "form" => Ok(EndpointStyle::OAuth),
            other => Err(format!("unknown endpoint style: {}", other)),
        }
    }
}

/// Token endpoint reached over HTTP
pub struct HttpTokenEndpoint {
    client: Client,
    url: String,
    style: EndpointStyle,
    client_id: Option<String>,
    client_secret: Option<SecretString>,
}

impl HttpTokenEndpoint {
    pub fn new(
        url: impl Into<String>,
        style: EndpointStyle,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        // Create HTTP client with timeout
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            style,
            client_id: None,
            client_secret: None,
        })
    }

    /// OAuth client credentials sent along with the refresh grant
    pub fn with_client_credentials(
        mut self,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        self.client_id = client_id;
        self.client_secret = client_secret.map(SecretString::new);
        self
    }

    async fn send(&self, refresh_secret: &str) -> Result<reqwest::Response, reqwest::Error> {
        match self.style {
            EndpointStyle::Json => {
                self.client
                    .post(&self.url)
                    .header("Content-Type", "application/json")
                    .header("User-Agent", user_agent())
                    .json(&JsonRefreshRequest {
                        refresh_token: refresh_secret,
                    })
                    .send()
                    .await
            }
            EndpointStyle::OAuth => {
                let mut form = vec![
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_secret),
                ];
                if let Some(client_id) = self.client_id.as_deref() {
                    form.push(("client_id", client_id));
                }
                if let Some(client_secret) = self.client_secret.as_ref() {
                    form.push(("client_secret", client_secret.expose_secret().as_str()));
                }

                self.client
                    .post(&self.url)
                    .header("User-Agent", user_agent())
                    .form(&form)
                    .send()
                    .await
            }
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(&self, refresh_secret: &str) -> Result<TokenData, RefreshFailure> {
        tracing::info!("Refreshing access token via {}...", self.url);

        let response = self.send(refresh_secret).await.map_err(|e| {
            if e.is_timeout() {
                RefreshFailure::Timeout
            } else {
                RefreshFailure::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();

            // Try to parse OAuth error for more details
            let error_code = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string));

            tracing::error!(
                status = status.as_u16(),
                error_code = error_code.as_deref().unwrap_or("-"),
                "Token refresh rejected by endpoint"
            );

            return Err(RefreshFailure::Status {
                status: status.as_u16(),
                error_code,
                body,
            });
        }

        let data: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshFailure::InvalidResponse(e.to_string()))?;

        if data.access_token.trim().is_empty() {
            return Err(RefreshFailure::InvalidResponse(
                "response does not contain an access token".to_string(),
            ));
        }

        let expires_at = match data.expires_in {
            Some(secs) => Some(expiry_after(secs).ok_or_else(|| {
                RefreshFailure::InvalidResponse(format!("expires_in out of range: {}", secs))
            })?),
            None => None,
        };

        match expires_at {
            Some(exp) => tracing::info!("Token refreshed, expires: {}", exp.to_rfc3339()),
            None => tracing::info!("Token refreshed, no expiry reported"),
        }

        Ok(TokenData {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at,
        })
    }
}

fn user_agent() -> String {
    format!("tokenkeeper/{}", env!("CARGO_PKG_VERSION"))
}
