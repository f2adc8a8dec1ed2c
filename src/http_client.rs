use anyhow::Context;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{redact, TokenProvider};
use crate::error::ApiError;

/// HTTP client for token-protected APIs with retry logic
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Supplies and refreshes the bearer token
    provider: Arc<dyn TokenProvider>,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ApiClient {
    /// Create a new HTTP client
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            provider,
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Execute an authenticated request.
    ///
    /// - 401: refreshes the rejected token once and retries immediately
    /// - 429 / 5xx / network errors: exponential backoff, whole operation retried
    pub async fn send(&self, request: Request) -> Result<Response, ApiError> {
        let max_retries = self.max_retries;
        let mut attempt = 0;
        let mut reauthenticated = false;

        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        // Token for the next attempt; `None` means ask the provider
        let mut next_token: Option<String> = None;

        loop {
            let token = match next_token.take() {
                Some(token) => token,
                None => self.provider.get_token().await?,
            };

            // Clone the request for this attempt
            let mut req = request.try_clone().ok_or_else(|| {
                ApiError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;
            let header = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("Token is not a valid header value")?;
            req.headers_mut().insert(AUTHORIZATION, header);

            tracing::debug!(
                attempt = attempt + 1,
                max_retries = max_retries,
                "Executing request attempt"
            );

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(status = %status, "Request successful");
                        return Ok(response);
                    }

                    match status {
                        StatusCode::UNAUTHORIZED if !reauthenticated => {
                            tracing::warn!(
                                "Received 401 for token {}, refreshing and retrying...",
                                redact(&token)
                            );
                            reauthenticated = true;
                            next_token = Some(self.provider.refresh_if_needed(&token).await?);
                            continue;
                        }

                        // 429 or 5xx: Exponential backoff
                        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                            if attempt < max_retries {
                                let delay = self.calculate_backoff_delay(attempt);
                                tracing::warn!(
                                    "Received {}, retrying after {}ms (attempt {}/{})",
                                    status,
                                    delay,
                                    attempt + 1,
                                    max_retries
                                );

                                tokio::time::sleep(Duration::from_millis(delay)).await;
                                attempt += 1;
                                continue;
                            }
                        }

                        _ => {}
                    }

                    // Non-retryable error or max retries exceeded
                    let error_text = response.text().await.unwrap_or_default();

                    tracing::error!(
                        status = status.as_u16(),
                        url = %url,
                        attempt = attempt + 1,
                        "HTTP request failed with error response"
                    );
                    return Err(ApiError::Status {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }

                Err(e) => {
                    // Categorize the error for better debugging
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else if e.is_body() {
                        "body_error"
                    } else if e.is_decode() {
                        "decode_error"
                    } else {
                        "unknown"
                    };

                    // Network error - retry with backoff
                    if attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            url = %url,
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            max_retries
                        );

                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );

                    return Err(ApiError::Http(format!("{} (kind: {})", e, error_kind)));
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // Exponential backoff: base_delay * 2^attempt
        // With jitter to avoid thundering herd
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}
