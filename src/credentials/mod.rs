//! Token persistence for OAuth-protected STH services.
//!
//! The token manager never talks to a storage backend directly; it is handed
//! an `Arc<dyn CredentialStore>` and persists every new token through it.
//!
//! ```text
//! ┌──────────────────────────┐
//! │      TokenManager        │
//! └──────────────────────────┘
//!        put ↓      ↑ get
//! ┌──────────────────────────┐
//! │  dyn CredentialStore     │
//! │  - MemoryCredentialStore │
//! │  - SqliteCredentialStore │──► TokenCipher (AES-256-GCM)
//! └──────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use sth_bridge::credentials::{CredentialStore, SqliteCredentialStore, Token};
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = std::env::var("STH_ENCRYPTION_KEY")?;
//! let store = SqliteCredentialStore::open("sth-credentials.db", &key)?;
//!
//! let token = Token::from_response(serde_json::json!({
//!     "access_token": "abc",
//!     "refresh_token": "def",
//!     "expires_in": 3600
//! }))?;
//! store.put("orion", &token)?;
//!
//! if let Some(token) = store.get("orion")? {
//!     println!("expires at {:?}", token.expires_at);
//! }
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

mod encryption;
mod storage;

pub use storage::SqliteCredentialStore;

/// An OAuth2 token as issued by the provider.
///
/// Tokens are replaced wholesale on every exchange or refresh, never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Value sent in the `X-Auth-Token` header
    pub access_token: String,

    /// Refresh material, if the provider issued any
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    pub expires_at: Option<DateTime<Utc>>,

    /// The provider's token response, kept verbatim
    pub raw: serde_json::Value,
}

impl Token {
    /// Builds a token from a standard RFC 6749 token response body.
    ///
    /// `expires_in` is converted to an absolute expiry relative to now.
    pub fn from_response(raw: serde_json::Value) -> Result<Self> {
        let access_token = raw
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("token response has no access_token"))?
            .to_string();

        let refresh_token = raw
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        // Some providers send expires_in as a string
        let expires_in = raw.get("expires_in").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse::<i64>().ok()))
        });
        let expires_at = match expires_in {
            Some(secs) => Some(
                Duration::try_seconds(secs)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .ok_or_else(|| anyhow!("token response expires_in out of range: {}", secs))?,
            ),
            None => None,
        };

        Ok(Self {
            access_token,
            refresh_token,
            expires_at,
            raw,
        })
    }

    /// True when a refresh is due: the token has an expiry and refresh
    /// material, and `now >= expires_at - margin`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match (&self.expires_at, &self.refresh_token) {
            (Some(expires_at), Some(_)) => expires_at
                .checked_sub_signed(margin)
                .map_or(true, |due| now >= due),
            _ => false,
        }
    }
}

/// Persistence capability for tokens, keyed by service id.
///
/// Implementations must make `put` an atomic replace.
pub trait CredentialStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Token>>;

    fn put(&self, id: &str, token: &Token) -> Result<()>;

    /// Returns `true` if a token was removed.
    fn delete(&self, id: &str) -> Result<bool>;
}

/// Non-persistent store, used when no database is configured.
#[derive(Default)]
pub struct MemoryCredentialStore {
    tokens: RwLock<HashMap<String, Token>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, id: &str) -> Result<Option<Token>> {
        let tokens = self
            .tokens
            .read()
            .map_err(|_| anyhow!("credential map lock poisoned"))?;
        Ok(tokens.get(id).cloned())
    }

    fn put(&self, id: &str, token: &Token) -> Result<()> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|_| anyhow!("credential map lock poisoned"))?;
        tokens.insert(id.to_string(), token.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|_| anyhow!("credential map lock poisoned"))?;
        Ok(tokens.remove(id).is_some())
    }
}
