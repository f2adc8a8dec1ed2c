// Credential persistence: JSON file and SQLite key/value stores

use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::PathBuf;

use super::store::{StoreError, TokenStore};
use super::types::{StoredToken, TokenRecord};

/// Default key for the SQLite store
pub const DEFAULT_SQLITE_KEY: &str = "tokenkeeper:token";

/// JSON credential file, written atomically (temp file + rename)
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<TokenRecord, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let content = String::from_utf8(bytes)
            .map_err(|e| StoreError::Corrupt(format!("credential file is not UTF-8: {}", e)))?;

        tracing::debug!("Loading credential from {}", self.path.display());

        if content.trim_start().starts_with('{') {
            decode_stored(&content)
        } else {
            // Legacy format: the bare token, no refresh secret
            TokenRecord::new(&content).ok_or(StoreError::NotFound)
        }
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let data = encode_stored(record)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data.as_bytes())?;

        // Set file permissions to 0600 on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        tracing::debug!("Credential saved to {}", self.path.display());
        Ok(())
    }

    fn exists(&self) -> bool {
        !matches!(self.load(), Err(StoreError::NotFound))
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Credential row in a SQLite `auth_kv` table
#[derive(Debug, Clone)]
pub struct SqliteTokenStore {
    path: PathBuf,
    key: String,
}

impl SqliteTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_key(path, DEFAULT_SQLITE_KEY)
    }

    pub fn with_key(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    fn open(&self) -> Result<rusqlite::Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = rusqlite::Connection::open(&self.path).map_err(|e| {
            StoreError::Database(format!(
                "Failed to open SQLite database {}: {}",
                self.path.display(),
                e
            ))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;

        Ok(conn)
    }
}

impl TokenStore for SqliteTokenStore {
    fn load(&self) -> Result<TokenRecord, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::NotFound);
        }

        let conn = self.open()?;
        let token_json: String = conn.query_row(
            "SELECT value FROM auth_kv WHERE key = ?",
            [&self.key],
            |row| row.get(0),
        )?;

        decode_stored(&token_json)
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        let data = encode_stored(record)?;
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
            [self.key.as_str(), data.as_str()],
        )?;

        tracing::debug!(
            "Credential saved to SQLite: {} (key: {})",
            self.path.display(),
            self.key
        );
        Ok(())
    }

    fn exists(&self) -> bool {
        if !self.path.exists() {
            return false;
        }

        self.open()
            .and_then(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM auth_kv WHERE key = ?",
                    [&self.key],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(StoreError::from)
            })
            .map(|count| count > 0)
            .unwrap_or(false)
    }

    fn clear(&self) -> Result<(), StoreError> {
        if !self.path.exists() {
            return Ok(());
        }

        let conn = self.open()?;
        conn.execute("DELETE FROM auth_kv WHERE key = ?", [&self.key])?;
        Ok(())
    }
}

fn encode_stored(record: &TokenRecord) -> Result<String, StoreError> {
    serde_json::to_string_pretty(&StoredToken::from(record))
        .map_err(|e| StoreError::Corrupt(format!("Failed to serialize credential: {}", e)))
}

fn decode_stored(data: &str) -> Result<TokenRecord, StoreError> {
    let stored: StoredToken = serde_json::from_str(data)
        .map_err(|e| StoreError::Corrupt(format!("Failed to parse credential: {}", e)))?;

    let expires_at = stored
        .expires_at
        .as_deref()
        .map(parse_datetime)
        .transpose()?;

    let record = stored
        .access_token
        .as_deref()
        .and_then(TokenRecord::new)
        .ok_or(StoreError::NotFound)?;

    let record = match stored.refresh_token.as_deref() {
        Some(secret) => record.with_refresh_secret(secret),
        None => record,
    };

    Ok(record.with_expires_at(expires_at))
}

/// Parse datetime from various ISO 8601 formats
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    // Handle Z suffix
    let normalized = if s.ends_with('Z') {
        s.replace('Z', "+00:00")
    } else {
        s.to_string()
    };

    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("Failed to parse datetime {}: {}", s, e)))
}
