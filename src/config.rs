use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::{
    EndpointStyle, FileTokenStore, HttpTokenEndpoint, RefresherSettings, SqliteTokenStore,
    StatusClassifier, TokenEndpoint, TokenStore, DEFAULT_SQLITE_KEY,
};

/// Token Keeper - credential lifecycle manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub args: CliArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct CliArgs {
    /// Credential store backend (file, sqlite)
    #[arg(long = "store", env = "TOKEN_STORE", default_value = "file", global = true)]
    pub store: String,

    /// Path of the credential file or SQLite database
    #[arg(long, env = "TOKEN_STORE_PATH", global = true)]
    pub store_path: Option<String>,

    /// Row key used by the SQLite store
    #[arg(long, env = "TOKEN_SQLITE_KEY", default_value = DEFAULT_SQLITE_KEY, global = true)]
    pub sqlite_key: String,

    /// Token endpoint URL used for refresh
    #[arg(short = 'e', long, env = "TOKEN_ENDPOINT", global = true)]
    pub token_endpoint: Option<String>,

    /// Token endpoint wire style (oauth, json)
    #[arg(long, env = "TOKEN_ENDPOINT_STYLE", default_value = "oauth", global = true)]
    pub endpoint_style: String,

    /// OAuth client id sent with refresh requests
    #[arg(long, env = "OAUTH_CLIENT_ID", global = true)]
    pub client_id: Option<String>,

    /// OAuth client secret sent with refresh requests
    #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true, global = true)]
    pub client_secret: Option<String>,

    /// Refresh this many seconds before expiry
    #[arg(long, env = "TOKEN_REFRESH_THRESHOLD", default_value = "300", global = true)]
    pub refresh_threshold: u64,

    /// Refresh call timeout in seconds
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "30", global = true)]
    pub refresh_timeout: u64,

    /// Token endpoint statuses that revoke the session (comma separated)
    #[arg(long, env = "TOKEN_PERMANENT_STATUSES", default_value = "400,401,403", global = true)]
    pub permanent_statuses: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "300", global = true)]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3", global = true)]
    pub http_retries: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show credential state
    Status,

    /// Print a valid access token, refreshing it if needed
    Token,

    /// Force a refresh of the current token
    Refresh,

    /// Store a credential obtained elsewhere
    Login {
        /// Access token
        #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
        token: String,

        /// Refresh token
        #[arg(long, env = "REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,

        /// Access token lifetime in seconds
        #[arg(long)]
        expires_in: Option<i64>,
    },

    /// Remove the stored credential
    Logout,

    /// Perform an authenticated request
    Call {
        /// Request URL
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreKind {
    File,
    Sqlite,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Credential store
    pub store_kind: StoreKind,
    pub store_path: PathBuf,
    pub sqlite_key: String,

    // Token endpoint
    pub token_endpoint: Option<String>,
    pub endpoint_style: EndpointStyle,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,

    // Refresh policy
    pub token_refresh_threshold: u64,
    pub token_refresh_timeout: u64,
    pub permanent_statuses: Vec<u16>,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
}

impl Cli {
    /// Parse command line, loading `.env` first so it can feed env-backed flags
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Cli::parse()
    }
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let store_kind = parse_store_kind(&args.store)?;

        let store_path = args
            .store_path
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| default_store_path(&store_kind));

        let endpoint_style = args
            .endpoint_style
            .parse::<EndpointStyle>()
            .map_err(anyhow::Error::msg)
            .context("Invalid TOKEN_ENDPOINT_STYLE")?;

        let permanent_statuses = parse_status_list(&args.permanent_statuses)
            .context("Invalid TOKEN_PERMANENT_STATUSES")?;

        Ok(Config {
            store_kind,
            store_path,
            sqlite_key: args.sqlite_key.clone(),

            token_endpoint: args
                .token_endpoint
                .clone()
                .filter(|url| !url.trim().is_empty()),
            endpoint_style,
            client_id: args.client_id.clone(),
            client_secret: args.client_secret.clone(),

            token_refresh_threshold: args.refresh_threshold,
            token_refresh_timeout: args.refresh_timeout,
            permanent_statuses,

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            log_level: args.log_level.clone(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.token_endpoint {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("TOKEN_ENDPOINT must be an http(s) URL: {}", url);
            }
        }

        if self.token_refresh_timeout == 0 {
            anyhow::bail!("TOKEN_REFRESH_TIMEOUT must be greater than zero");
        }

        self.lead_time()?;

        Ok(())
    }

    /// Refresh tuning derived from this configuration
    pub fn refresher_settings(&self) -> Result<RefresherSettings> {
        Ok(RefresherSettings {
            lead_time: self.lead_time()?,
            refresh_timeout: std::time::Duration::from_secs(self.token_refresh_timeout),
            classifier: Arc::new(StatusClassifier::new(self.permanent_statuses.clone())),
        })
    }

    fn lead_time(&self) -> Result<chrono::Duration> {
        i64::try_from(self.token_refresh_threshold)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .filter(|lead| Utc::now().checked_add_signed(*lead).is_some())
            .with_context(|| {
                format!(
                    "TOKEN_REFRESH_THRESHOLD out of range: {}",
                    self.token_refresh_threshold
                )
            })
    }

    /// Token endpoint client, if one is configured
    pub fn token_endpoint(&self) -> Result<Option<Arc<dyn TokenEndpoint>>> {
        let Some(url) = &self.token_endpoint else {
            return Ok(None);
        };

        let endpoint = HttpTokenEndpoint::new(
            url.clone(),
            self.endpoint_style,
            std::time::Duration::from_secs(self.token_refresh_timeout),
        )?
        .with_client_credentials(self.client_id.clone(), self.client_secret.clone());

        Ok(Some(Arc::new(endpoint)))
    }

    /// Open the configured credential store
    pub fn token_store(&self) -> Arc<dyn TokenStore> {
        match self.store_kind {
            StoreKind::File => Arc::new(FileTokenStore::new(&self.store_path)),
            StoreKind::Sqlite => Arc::new(SqliteTokenStore::with_key(
                &self.store_path,
                self.sqlite_key.clone(),
            )),
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default credential location under the user's config directory
fn default_store_path(kind: &StoreKind) -> PathBuf {
    let file_name = match kind {
        StoreKind::File => "token.json",
        StoreKind::Sqlite => "data.sqlite3",
    };

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tokenkeeper")
        .join(file_name)
}

/// Parse store kind from string
fn parse_store_kind(s: &str) -> Result<StoreKind> {
    match s.to_lowercase().as_str() {
        "file" | "json" => Ok(StoreKind::File),
        "sqlite" => Ok(StoreKind::Sqlite),
        other => anyhow::bail!("Unknown TOKEN_STORE: {} (expected file or sqlite)", other),
    }
}

/// Parse a comma separated list of HTTP status codes
fn parse_status_list(s: &str) -> Result<Vec<u16>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let code: u16 = part
                .parse()
                .with_context(|| format!("Not a status code: {}", part))?;
            if !(100..=599).contains(&code) {
                anyhow::bail!("Status code out of range: {}", code);
            }
            Ok(code)
        })
        .collect()
}
