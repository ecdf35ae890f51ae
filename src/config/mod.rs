use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::history::ResponseFormat;

/// Complete sth-bridge configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// STH services keyed by id
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:1880".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Token refresh policy
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Refresh once the token is this close to expiry (seconds)
    #[serde(default = "default_margin_seconds")]
    pub margin_seconds: i64,
}

fn default_margin_seconds() -> i64 {
    180
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            margin_seconds: default_margin_seconds(),
        }
    }
}

/// Upper bound on `margin_seconds` (one day)
const MAX_MARGIN_SECONDS: i64 = 86_400;

impl RefreshConfig {
    /// The refresh margin. Fails with `Error::Config` outside
    /// `0..=86400` seconds.
    pub fn margin(&self) -> Result<chrono::Duration> {
        if !(0..=MAX_MARGIN_SECONDS).contains(&self.margin_seconds) {
            return Err(Error::Config(format!(
                "refresh margin_seconds must be between 0 and {}, got {}",
                MAX_MARGIN_SECONDS, self.margin_seconds
            )));
        }
        Ok(chrono::Duration::seconds(self.margin_seconds))
    }
}

/// Token persistence. Without a database, tokens live in memory only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    pub database: Option<String>,
}

/// One STH endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    /// Host name or full base URL (`http://...`, `https://...`)
    #[serde(default)]
    pub url: String,
    /// Used only when `url` has no scheme
    pub port: Option<u16>,
    #[serde(default)]
    pub fiware_service: String,
    #[serde(default = "default_service_path")]
    pub fiware_service_path: String,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub query: QueryDefaults,
}

fn default_service_path() -> String {
    "/".to_string()
}

impl ServiceConfig {
    /// Resolves the base URL the STH path is appended to.
    ///
    /// A bare host becomes `http://<host>:<port>` and then requires a port.
    /// A trailing slash is dropped.
    pub fn base_url(&self) -> Result<String> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(Error::Config("Missing url".to_string()));
        }

        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            let port = self
                .port
                .ok_or_else(|| Error::Config("Missing port".to_string()))?;
            format!("http://{}:{}", url, port)
        };

        Ok(url.trim_end_matches('/').to_string())
    }
}

/// OAuth2 client settings. Every field may be left empty for services that
/// do not require authentication.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub auth_server_uri: String,
    #[serde(default)]
    pub authorize_path: String,
    #[serde(default)]
    pub token_path: String,
}

impl OAuthConfig {
    pub fn authorize_url(&self) -> String {
        join_url(&self.auth_server_uri, &self.authorize_path)
    }

    pub fn token_url(&self) -> String {
        join_url(&self.auth_server_uri, &self.token_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Per-service query settings used when a trigger does not supply them.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryDefaults {
    pub entity_type: Option<String>,
    pub attribute: Option<String>,
    #[serde(default = "default_last_n")]
    pub last_n: u32,
    /// History window in milliseconds; 0 disables `dateFrom`
    #[serde(default)]
    pub period_ms: i64,
    /// `txt` or `bin`
    #[serde(default)]
    pub format: ResponseFormat,
}

fn default_last_n() -> u32 {
    10
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            entity_type: None,
            attribute: None,
            last_n: default_last_n(),
            period_ms: 0,
            format: ResponseFormat::default(),
        }
    }
}

impl BridgeConfig {
    /// Applies `STH_*` environment overrides.
    ///
    /// Client credentials come from `STH_OAUTH_<ID>_CLIENT_ID` and
    /// `STH_OAUTH_<ID>_CLIENT_SECRET`, with `<ID>` upper-cased and `-`
    /// replaced by `_`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STH_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("STH_REFRESH_MARGIN_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.refresh.margin_seconds = n;
            }
        }
        if let Some(v) = lookup("STH_CREDENTIALS_DATABASE") {
            self.credentials.database = Some(v);
        }

        for (id, service) in self.services.iter_mut() {
            let prefix = env_prefix(id);
            if let Some(v) = lookup(&format!("STH_OAUTH_{}_CLIENT_ID", prefix)) {
                service.oauth.client_id = v;
            }
            if let Some(v) = lookup(&format!("STH_OAUTH_{}_CLIENT_SECRET", prefix)) {
                service.oauth.client_secret = v;
            }
        }
    }
}

fn env_prefix(id: &str) -> String {
    id.to_uppercase().replace('-', "_")
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<BridgeConfig> {
    use anyhow::Context;

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: BridgeConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    Ok(config)
}
