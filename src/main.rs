use anyhow::{Context, Result};
use std::sync::Arc;
use sth_bridge::api::{create_router, AppState};
use sth_bridge::config::{self, BridgeConfig};
use sth_bridge::credentials::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore};
use sth_bridge::service::ServiceRegistry;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sth_bridge=info".into()),
        )
        .init();

    info!("sth-bridge starting...");

    let config_path =
        std::env::var("STH_CONFIG").unwrap_or_else(|_| "sth-bridge.toml".to_string());
    let mut config = if std::path::Path::new(&config_path).exists() {
        info!(path = %config_path, "Loading configuration");
        config::load_config(&config_path)?
    } else {
        warn!(path = %config_path, "Config file not found, using defaults");
        BridgeConfig::default()
    };
    config.apply_env();

    let store = open_credential_store(&config)?;
    let services = ServiceRegistry::from_config(&config, store)
        .context("Failed to initialize services")?;
    if services.is_empty() {
        warn!("No services configured");
    }

    let app = create_router(AppState::new(services));

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Listening");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn open_credential_store(config: &BridgeConfig) -> Result<Arc<dyn CredentialStore>> {
    match &config.credentials.database {
        Some(path) => {
            let key = std::env::var("STH_ENCRYPTION_KEY")
                .context("STH_ENCRYPTION_KEY must be set when a credentials database is configured")?;
            let store = SqliteCredentialStore::open(path, &key)
                .with_context(|| format!("Failed to open credential store {}", path))?;
            info!(path = %path, "Using encrypted credential store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No credentials database configured, tokens will not survive a restart");
            Ok(Arc::new(MemoryCredentialStore::new()))
        }
    }
}
