use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use secrecy::{ExposeSecret, SecretString};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use super::refresh::{
    FailureClassifier, FailureKind, RefreshFailure, StatusClassifier, TokenEndpoint,
};
use super::sanitize::{redact, sanitize};
use super::store::{StoreError, TokenStore};
use super::types::{TokenRecord, TokenState};
use crate::error::AuthError;

/// One in-flight refresh, shared by every caller waiting on it
type RefreshFlight = Shared<BoxFuture<'static, Result<String, AuthError>>>;

/// Tuning for a [`Refresher`]
#[derive(Clone)]
pub struct RefresherSettings {
    /// Refresh proactively once expiry is this close (default: 5 minutes)
    pub lead_time: Duration,

    /// Upper bound for one refresh call; exceeding it is a transient failure
    pub refresh_timeout: std::time::Duration,

    /// Splits refresh failures into transient and permanent
    pub classifier: Arc<dyn FailureClassifier>,
}

impl Default for RefresherSettings {
    fn default() -> Self {
        Self {
            lead_time: Duration::seconds(300),
            refresh_timeout: std::time::Duration::from_secs(30),
            classifier: Arc::new(StatusClassifier::default()),
        }
    }
}

struct Session {
    record: TokenRecord,

    /// Set after a permanent refresh failure or logout; cleared by `replace`
    invalid: Option<String>,

    in_flight: Option<RefreshFlight>,

    /// Identifies the refresh currently held in `in_flight`
    flight_id: u64,

    /// Bumped on every install so a stale refresh result cannot overwrite a newer record
    generation: u64,
}

impl Session {
    fn current_value(&self) -> Result<String, AuthError> {
        match &self.invalid {
            Some(reason) => Err(AuthError::CredentialInvalid(reason.clone())),
            None => Ok(self.record.value().to_string()),
        }
    }
}

struct Inner {
    session: Mutex<Session>,
    store: Arc<dyn TokenStore>,
    /// `None` for a session that can only install or clear credentials
    endpoint: Option<Arc<dyn TokenEndpoint>>,
    settings: RefresherSettings,
}

/// Owner of the session's current credential.
///
/// Serializes all state changes behind one mutex and guarantees at most one
/// refresh call in flight. The mutex is never held across the network call;
/// callers that need the refresh result await a shared future instead.
/// Cloning is cheap and every clone refers to the same session.
#[derive(Clone)]
pub struct Refresher {
    inner: Arc<Inner>,
}

impl Refresher {
    pub fn new(
        record: TokenRecord,
        store: Arc<dyn TokenStore>,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        Self::with_settings(record, store, endpoint, RefresherSettings::default())
    }

    pub fn with_settings(
        record: TokenRecord,
        store: Arc<dyn TokenStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        settings: RefresherSettings,
    ) -> Self {
        Self::build(record, store, Some(endpoint), settings)
    }

    /// Session without a token endpoint.
    ///
    /// Tokens are served until they expire but never refreshed; `replace` and
    /// `logout` work as usual.
    pub fn detached(
        record: TokenRecord,
        store: Arc<dyn TokenStore>,
        settings: RefresherSettings,
    ) -> Self {
        Self::build(record, store, None, settings)
    }

    fn build(
        record: TokenRecord,
        store: Arc<dyn TokenStore>,
        endpoint: Option<Arc<dyn TokenEndpoint>>,
        settings: RefresherSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Session {
                    record,
                    invalid: None,
                    in_flight: None,
                    flight_id: 0,
                    generation: 0,
                }),
                store,
                endpoint,
                settings,
            }),
        }
    }

    /// Seed a refresher from the persisted credential
    pub fn from_store(
        store: Arc<dyn TokenStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        settings: RefresherSettings,
    ) -> Result<Self, AuthError> {
        let record = store.load()?;
        tracing::info!(
            "Loaded credential (token: {}, refreshable: {})",
            redact(record.value()),
            record.has_refresh_secret()
        );
        Ok(Self::with_settings(record, store, endpoint, settings))
    }

    /// Get a valid access token, refreshing first if it is close to expiry
    pub async fn get_valid_token(&self) -> Result<String, AuthError> {
        let flight = {
            let mut guard = self.inner.session.lock().await;
            let session = &mut *guard;

            if let Some(reason) = &session.invalid {
                return Err(AuthError::CredentialInvalid(reason.clone()));
            }

            if let Some(flight) = session.in_flight.clone() {
                tracing::debug!("Joining in-flight token refresh");
                flight
            } else {
                let now = Utc::now();
                if !session
                    .record
                    .is_expiring_at(now, self.inner.settings.lead_time)
                {
                    return Ok(session.record.value().to_string());
                }

                let Some(secret) = session.record.refresh_secret().map(str::to_string) else {
                    if session.record.is_expired_at(now) {
                        return Err(AuthError::NoRefreshToken);
                    }
                    tracing::warn!(
                        "Token expiring soon and no refresh token is available; using it until expiry"
                    );
                    return Ok(session.record.value().to_string());
                };

                let Some(endpoint) = self.inner.endpoint.clone() else {
                    if session.record.is_expired_at(now) {
                        return Err(AuthError::NoRefreshCapability);
                    }
                    tracing::warn!(
                        "Token expiring soon and no token endpoint is configured; using it until expiry"
                    );
                    return Ok(session.record.value().to_string());
                };

                tracing::debug!("Token expiring soon, refreshing proactively");
                self.start_refresh(session, endpoint, secret)
            }
        };

        flight.await
    }

    /// Recover from an authentication failure on `failed_token`.
    ///
    /// If the current token already differs from the one that failed, someone
    /// else refreshed in the meantime and the current value is returned
    /// without a network call.
    pub async fn refresh_if_needed(&self, failed_token: &str) -> Result<String, AuthError> {
        let failed_token = sanitize(failed_token);

        let flight = {
            let mut guard = self.inner.session.lock().await;
            let session = &mut *guard;

            if let Some(reason) = &session.invalid {
                return Err(AuthError::CredentialInvalid(reason.clone()));
            }

            if session.record.value() != failed_token {
                tracing::debug!(
                    "Rejected token {} already superseded, skipping refresh",
                    redact(&failed_token)
                );
                return Ok(session.record.value().to_string());
            }

            if let Some(flight) = session.in_flight.clone() {
                tracing::debug!("Joining in-flight token refresh");
                flight
            } else {
                let Some(secret) = session.record.refresh_secret().map(str::to_string) else {
                    return Err(AuthError::NoRefreshToken);
                };
                let Some(endpoint) = self.inner.endpoint.clone() else {
                    return Err(AuthError::NoRefreshCapability);
                };

                tracing::info!(
                    "Token {} rejected by API, refreshing",
                    redact(&failed_token)
                );
                self.start_refresh(session, endpoint, secret)
            }
        };

        flight.await
    }

    /// Current lifecycle state
    pub async fn state(&self) -> TokenState {
        let session = self.inner.session.lock().await;
        if session.invalid.is_some() {
            TokenState::Invalid
        } else if session.in_flight.is_some() {
            TokenState::Refreshing
        } else {
            session
                .record
                .state_at(Utc::now(), self.inner.settings.lead_time)
        }
    }

    /// Copy of the current record
    pub async fn snapshot(&self) -> TokenRecord {
        self.inner.session.lock().await.record.clone()
    }

    /// Install a freshly obtained credential (re-login).
    ///
    /// Clears a previous invalidation. A refresh still in flight keeps
    /// running but can no longer commit its result.
    pub async fn replace(&self, record: TokenRecord) -> Result<(), AuthError> {
        let mut session = self.inner.session.lock().await;
        self.inner.persist(&record).await?;

        tracing::info!("Credential replaced (token: {})", redact(record.value()));
        session.record = record;
        session.invalid = None;
        session.in_flight = None;
        session.generation += 1;
        Ok(())
    }

    /// Clear the stored credential and end the session
    pub async fn logout(&self) -> Result<(), AuthError> {
        let mut session = self.inner.session.lock().await;
        self.inner.erase().await?;

        tracing::info!("Logged out, stored credential cleared");
        session.record.forget_refresh_secret();
        session.invalid = Some("logged out".to_string());
        session.in_flight = None;
        session.generation += 1;
        Ok(())
    }

    /// Spawn the refresh call and register it as the session's in-flight refresh.
    ///
    /// Runs as its own task so a caller dropping its future does not cancel
    /// the refresh for everyone else waiting on it. If the task dies without
    /// committing, the first waiter to observe it releases the slot so the
    /// next caller can start over.
    fn start_refresh(
        &self,
        session: &mut Session,
        endpoint: Arc<dyn TokenEndpoint>,
        secret: String,
    ) -> RefreshFlight {
        let inner = Arc::clone(&self.inner);
        session.flight_id += 1;
        let flight_id = session.flight_id;

        let task = tokio::spawn(Arc::clone(&inner).run_refresh(
            endpoint,
            SecretString::new(secret),
            session.generation,
        ));

        let flight = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Token refresh task aborted: {}", e);
                    inner.release_flight(flight_id).await;
                    Err(AuthError::TransientRefreshFailure(format!(
                        "refresh task aborted: {}",
                        e
                    )))
                }
            }
        }
        .boxed()
        .shared();

        session.in_flight = Some(flight.clone());
        flight
    }
}

impl Inner {
    async fn run_refresh(
        self: Arc<Self>,
        endpoint: Arc<dyn TokenEndpoint>,
        secret: SecretString,
        generation: u64,
    ) -> Result<String, AuthError> {
        let started = Instant::now();

        // Network call, outside the session lock
        let call = AssertUnwindSafe(endpoint.refresh(secret.expose_secret())).catch_unwind();
        let outcome = match tokio::time::timeout(self.settings.refresh_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(RefreshFailure::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(RefreshFailure::Timeout),
        };

        let outcome = outcome.and_then(|data| {
            TokenRecord::from_refresh(data, secret.expose_secret()).ok_or_else(|| {
                RefreshFailure::InvalidResponse(
                    "response does not contain an access token".to_string(),
                )
            })
        });

        let mut session = self.session.lock().await;
        if session.generation != generation {
            tracing::debug!("Discarding refresh result superseded by a newer credential");
            return session.current_value();
        }
        session.in_flight = None;

        match outcome {
            Ok(record) => {
                // Keep the new record even if persisting fails: a rotated
                // refresh secret may be single-use
                if let Err(e) = self.persist(&record).await {
                    tracing::error!("Failed to persist refreshed credential: {}", e);
                }

                let value = record.value().to_string();
                session.record = record;
                session.generation += 1;

                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Access token refreshed (token: {})",
                    redact(&value)
                );
                Ok(value)
            }
            Err(failure) => match self.settings.classifier.classify(&failure) {
                FailureKind::Transient => {
                    tracing::warn!("Token refresh failed, caller may retry: {}", failure);
                    Err(AuthError::TransientRefreshFailure(failure.to_string()))
                }
                FailureKind::Permanent => {
                    tracing::error!(
                        "Refresh token rejected, re-authentication required: {}",
                        failure
                    );
                    let reason = failure.to_string();
                    session.record.forget_refresh_secret();
                    session.invalid = Some(reason.clone());
                    Err(AuthError::CredentialInvalid(reason))
                }
            },
        }
    }

    /// Drop the in-flight refresh `flight_id` if it is still registered
    async fn release_flight(&self, flight_id: u64) {
        let mut session = self.session.lock().await;
        if session.in_flight.is_some() && session.flight_id == flight_id {
            session.in_flight = None;
        }
    }

    /// Save on the blocking pool; store writes may fsync
    async fn persist(&self, record: &TokenRecord) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.save(&record))
            .await
            .unwrap_or_else(|e| Err(blocking_failed(e)))
    }

    async fn erase(&self) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.clear())
            .await
            .unwrap_or_else(|e| Err(blocking_failed(e)))
    }
}

fn blocking_failed(e: tokio::task::JoinError) -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("store task failed: {}", e),
    ))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
