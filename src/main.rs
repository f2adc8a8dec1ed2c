use anyhow::{Context, Result};
use std::sync::Arc;

use token_keeper::auth::{
    build_provider, expiry_after, redact, Refresher, StoreError, TokenProvider, TokenRecord,
    TokenStore,
};
use token_keeper::config::{Cli, Command, Config};
use token_keeper::error::AuthError;
use token_keeper::http_client::ApiClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::load();

    let config = Config::from_args(&cli.args)?;
    config.validate()?;

    // Logs go to stderr so stdout stays usable for `token`
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(
        store = ?config.store_kind,
        path = %config.store_path.display(),
        "Using credential store"
    );

    let store = config.token_store();

    match cli.command {
        Command::Status => status(&config, store).await,
        Command::Token => {
            let provider = load_provider(&config, store)?;
            let token = provider.get_token().await?;
            println!("{}", token);
            Ok(())
        }
        Command::Refresh => {
            let provider = load_provider(&config, store)?;
            let current = provider.get_token().await?;
            let token = provider.refresh_if_needed(&current).await?;
            tracing::info!("Token refreshed ({})", redact(&token));
            println!("{}", token);
            Ok(())
        }
        Command::Login {
            token,
            refresh_token,
            expires_in,
        } => {
            let expires_at = expires_in
                .map(|secs| {
                    expiry_after(secs)
                        .with_context(|| format!("--expires-in out of range: {}", secs))
                })
                .transpose()?;

            let record = TokenRecord::new(&token)
                .context("Access token is empty")?
                .with_refresh_secret(refresh_token.as_deref().unwrap_or_default())
                .with_expires_at(expires_at);

            let refresher = session(&config, record.clone(), store)?;
            refresher.replace(record.clone()).await?;
            println!("Credential stored ({})", redact(record.value()));
            Ok(())
        }
        Command::Logout => logout(&config, store).await,
        Command::Call { url, method } => {
            let provider = load_provider(&config, store)?;
            let client = ApiClient::new(
                provider,
                config.http_max_connections,
                config.http_connect_timeout,
                config.http_request_timeout,
                config.http_max_retries,
            )?;

            let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
                .context("Invalid HTTP method")?;
            let request = client
                .client()
                .request(method, &url)
                .build()
                .context("Failed to build request")?;

            let response = client.send(request).await?;
            println!("{}", response.status());
            let body = response.text().await.context("Failed to read response body")?;
            println!("{}", body);
            Ok(())
        }
    }
}

/// Load the stored credential and wrap it in the right provider
fn load_provider(config: &Config, store: Arc<dyn TokenStore>) -> Result<Arc<dyn TokenProvider>> {
    let record = store.load().map_err(AuthError::from).map_err(login_hint)?;
    Ok(build_provider(
        record,
        store,
        config.token_endpoint()?,
        config.refresher_settings()?,
    ))
}

/// Session owning `record`, refreshable when an endpoint is configured
fn session(config: &Config, record: TokenRecord, store: Arc<dyn TokenStore>) -> Result<Refresher> {
    let settings = config.refresher_settings()?;
    Ok(match config.token_endpoint()? {
        Some(endpoint) => Refresher::with_settings(record, store, endpoint, settings),
        None => Refresher::detached(record, store, settings),
    })
}

async fn logout(config: &Config, store: Arc<dyn TokenStore>) -> Result<()> {
    match store.load() {
        Ok(record) => {
            session(config, record, store)?.logout().await?;
        }
        Err(StoreError::NotFound) => {
            println!("No credential stored");
            return Ok(());
        }
        Err(StoreError::Corrupt(reason)) => {
            // No session can be built from an unreadable credential
            tracing::warn!("Removing unreadable credential: {}", reason);
            store.clear()?;
        }
        Err(e) => return Err(e.into()),
    }

    println!("Credential removed");
    Ok(())
}

async fn status(config: &Config, store: Arc<dyn TokenStore>) -> Result<()> {
    let record = match store.load() {
        Ok(record) => record,
        Err(StoreError::NotFound) => {
            println!("  State:       no credential");
            println!("  Store:       {}", config.store_path.display());
            return Ok(());
        }
        Err(e) => return Err(login_hint(e.into())),
    };

    let state = session(config, record.clone(), store)?.state().await;

    println!("  State:       {}", state);
    println!(
        "  Expires:     {}",
        record
            .expires_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    println!("  Refreshable: {}", record.has_refresh_secret());
    println!("  Token:       {}", redact(record.value()));
    println!("  Store:       {}", config.store_path.display());
    Ok(())
}

fn login_hint(e: AuthError) -> anyhow::Error {
    if e.requires_login() {
        anyhow::Error::new(e).context("Re-authenticate with `tokenkeeper login --token ...`")
    } else {
        anyhow::Error::new(e)
    }
}
