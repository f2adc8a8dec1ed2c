// Authentication types

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::sanitize::sanitize;

/// Lifecycle state of the current credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No expiry, or expiry further away than the refresh lead time
    Valid,

    /// Within the lead time, possibly already past expiry
    ExpiringSoon,

    /// A refresh call is in flight
    Refreshing,

    /// Cannot be used or refreshed until the next login
    Invalid,
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenState::Valid => "valid",
            TokenState::ExpiringSoon => "expiring_soon",
            TokenState::Refreshing => "refreshing",
            TokenState::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// One credential snapshot.
///
/// The value is never empty: [`TokenRecord::new`] returns `None` instead.
/// Both secrets are redacted in `Debug` output.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    value: SecretString,
    refresh_secret: Option<SecretString>,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    /// Build a record from a raw token value; `None` if it sanitizes to nothing
    pub fn new(value: &str) -> Option<Self> {
        let value = sanitize(value);
        if value.is_empty() {
            return None;
        }

        Some(Self {
            value: SecretString::new(value),
            refresh_secret: None,
            expires_at: None,
        })
    }

    /// Attach a refresh secret. An empty secret leaves the record without one.
    pub fn with_refresh_secret(mut self, secret: &str) -> Self {
        let secret = sanitize(secret);
        self.refresh_secret = if secret.is_empty() {
            None
        } else {
            Some(SecretString::new(secret))
        };
        self
    }

    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn value(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn refresh_secret(&self) -> Option<&str> {
        self.refresh_secret
            .as_ref()
            .map(|s| s.expose_secret().as_str())
    }

    pub fn has_refresh_secret(&self) -> bool {
        self.refresh_secret.is_some()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Past expiry. Records without expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => false,
            Some(exp) => now >= exp,
        }
    }

    /// Within `lead_time` of expiry (or past it)
    pub fn is_expiring_at(&self, now: DateTime<Utc>, lead_time: Duration) -> bool {
        match self.expires_at {
            None => false,
            Some(exp) => exp <= now + lead_time,
        }
    }

    /// State as far as the record itself can tell; `Refreshing` and sticky
    /// invalidation are tracked by the refresher
    pub fn state_at(&self, now: DateTime<Utc>, lead_time: Duration) -> TokenState {
        if !self.is_expiring_at(now, lead_time) {
            TokenState::Valid
        } else if self.is_expired_at(now) && !self.has_refresh_secret() {
            TokenState::Invalid
        } else {
            TokenState::ExpiringSoon
        }
    }

    /// Drop the refresh secret after it was rejected
    pub(crate) fn forget_refresh_secret(&mut self) {
        self.refresh_secret = None;
    }

    /// Build the successor record from a refresh response.
    ///
    /// Keeps `used_secret` when the endpoint did not rotate it.
    pub(crate) fn from_refresh(data: TokenData, used_secret: &str) -> Option<Self> {
        let rotated = data.refresh_token.as_deref().map(sanitize);
        let secret = match rotated.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => used_secret.to_string(),
        };

        Some(
            Self::new(&data.access_token)?
                .with_refresh_secret(&secret)
                .with_expires_at(data.expires_at),
        )
    }
}

/// Expiry instant for a lifetime of `secs` seconds from now.
///
/// `None` for a negative lifetime or one that does not fit a timestamp.
pub fn expiry_after(secs: i64) -> Option<DateTime<Utc>> {
    if secs < 0 {
        return None;
    }
    Utc::now().checked_add_signed(Duration::try_seconds(secs)?)
}

/// Token data returned by the remote token endpoint
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// JSON-style refresh request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh response; accepts both OAuth snake_case and camelCase field names
#[derive(Deserialize)]
pub struct RefreshResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<i64>,
}

/// Persisted form of a [`TokenRecord`], shared by the file and SQLite stores
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl From<&TokenRecord> for StoredToken {
    fn from(record: &TokenRecord) -> Self {
        Self {
            access_token: Some(record.value().to_string()),
            refresh_token: record.refresh_secret().map(str::to_string),
            expires_at: record.expires_at().map(|dt| dt.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_after() {
        let expiry = expiry_after(3600).unwrap();
        assert!(expiry > Utc::now() + Duration::minutes(59));
        assert!(expiry_after(0).is_some());

        assert!(expiry_after(-1).is_none());
        assert!(expiry_after(i64::MAX).is_none());
        assert!(expiry_after(10_000_000_000_000_000).is_none());
    }

    #[test]
    fn test_empty_value_is_absence() {
        assert!(TokenRecord::new("").is_none());
        assert!(TokenRecord::new("  \n").is_none());
        assert!(TokenRecord::new("\"\"").is_none());
    }

    #[test]
    fn test_value_is_sanitized() {
        let record = TokenRecord::new("  tok\n").unwrap().with_refresh_secret("'rt'\n");
        assert_eq!(record.value(), "tok");
        assert_eq!(record.refresh_secret(), Some("rt"));
    }

    #[test]
    fn test_empty_refresh_secret_is_absent() {
        let record = TokenRecord::new("tok").unwrap().with_refresh_secret(" ");
        assert!(!record.has_refresh_secret());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let record = TokenRecord::new("super-secret-value")
            .unwrap()
            .with_refresh_secret("refresh-secret-value");
        let debug = format!("{:?}", record);
        assert!(!debug.contains("super-secret-value"));
        assert!(!debug.contains("refresh-secret-value"));
    }

    #[test]
    fn test_state_without_expiry_is_valid() {
        let record = TokenRecord::new("tok").unwrap();
        let now = Utc::now();
        assert!(!record.is_expired_at(now));
        assert_eq!(record.state_at(now, Duration::seconds(300)), TokenState::Valid);
    }

    #[test]
    fn test_state_by_expiry() {
        let now = Utc::now();
        let lead = Duration::seconds(300);
        let base = TokenRecord::new("tok").unwrap().with_refresh_secret("rt");

        // Token expires in 10 minutes, threshold is 5 minutes - should not need refresh
        let record = base.clone().with_expires_at(Some(now + Duration::seconds(600)));
        assert_eq!(record.state_at(now, lead), TokenState::Valid);

        let record = base.clone().with_expires_at(Some(now + Duration::seconds(120)));
        assert_eq!(record.state_at(now, lead), TokenState::ExpiringSoon);
        assert!(!record.is_expired_at(now));

        let record = base.with_expires_at(Some(now - Duration::seconds(60)));
        assert_eq!(record.state_at(now, lead), TokenState::ExpiringSoon);
        assert!(record.is_expired_at(now));
    }

    #[test]
    fn test_expired_without_refresh_secret_is_invalid() {
        let now = Utc::now();
        let record = TokenRecord::new("tok")
            .unwrap()
            .with_expires_at(Some(now - Duration::seconds(1)));
        assert_eq!(record.state_at(now, Duration::seconds(300)), TokenState::Invalid);
    }

    #[test]
    fn test_from_refresh_keeps_secret_when_not_rotated() {
        let data = TokenData {
            access_token: "new".to_string(),
            refresh_token: None,
            expires_at: None,
        };
        let record = TokenRecord::from_refresh(data, "old-rt").unwrap();
        assert_eq!(record.value(), "new");
        assert_eq!(record.refresh_secret(), Some("old-rt"));
    }

    #[test]
    fn test_from_refresh_rotates_secret() {
        let data = TokenData {
            access_token: "new".to_string(),
            refresh_token: Some("new-rt".to_string()),
            expires_at: None,
        };
        let record = TokenRecord::from_refresh(data, "old-rt").unwrap();
        assert_eq!(record.refresh_secret(), Some("new-rt"));
    }

    #[test]
    fn test_from_refresh_rejects_empty_token() {
        let data = TokenData {
            access_token: " ".to_string(),
            refresh_token: None,
            expires_at: None,
        };
        assert!(TokenRecord::from_refresh(data, "rt").is_none());
    }

    #[test]
    fn test_refresh_response_accepts_both_casings() {
        let snake: RefreshResponse = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","expires_in":3600}"#,
        )
        .unwrap();
        assert_eq!(snake.access_token, "a");
        assert_eq!(snake.expires_in, Some(3600));

        let camel: RefreshResponse =
            serde_json::from_str(r#"{"accessToken":"a","refreshToken":"r"}"#).unwrap();
        assert_eq!(camel.refresh_token.as_deref(), Some("r"));
        assert_eq!(camel.expires_in, None);
    }
}
