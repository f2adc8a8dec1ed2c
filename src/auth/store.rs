// Token persistence contract

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use super::types::TokenRecord;

/// Errors from a [`TokenStore`]
#[derive(Error, Debug)]
pub enum StoreError {
    /// Nothing has been saved yet
    #[error("No stored credential")]
    NotFound,

    /// Stored data exists but cannot be parsed
    #[error("Stored credential is corrupt: {0}")]
    Corrupt(String),

    #[error("Credential file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Durable home of the current credential.
///
/// `save` must be atomic: after a crash either the old or the new record is
/// readable, never a mix. Only the refresher and explicit login/logout write
/// through this trait.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<TokenRecord, StoreError>;

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError>;

    fn exists(&self) -> bool;

    fn clear(&self) -> Result<(), StoreError>;
}

/// In-process store, used by tests and embedders that persist elsewhere
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    record: Mutex<Option<TokenRecord>>,
    saves: AtomicUsize,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: TokenRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful `save` calls
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<TokenRecord>> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<TokenRecord, StoreError> {
        self.slot().clone().ok_or(StoreError::NotFound)
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        *self.slot() = Some(record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exists(&self) -> bool {
        self.slot().is_some()
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot() = None;
        Ok(())
    }
}
