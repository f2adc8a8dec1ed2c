// Authentication module
// Manages token lifecycle, refresh and credential persistence

mod credentials;
mod provider;
mod refresh;
mod refresher;
mod sanitize;
mod store;
mod types;

pub use credentials::{FileTokenStore, SqliteTokenStore, DEFAULT_SQLITE_KEY};
pub use provider::{build_provider, RefreshingProvider, StaticProvider, TokenProvider};
pub use refresh::{
    EndpointStyle, FailureClassifier, FailureKind, HttpTokenEndpoint, RefreshFailure,
    StatusClassifier, TokenEndpoint,
};
pub use refresher::{Refresher, RefresherSettings};
pub use sanitize::{redact, sanitize};
pub use store::{MemoryTokenStore, StoreError, TokenStore};
pub use types::{expiry_after, TokenData, TokenRecord, TokenState};
