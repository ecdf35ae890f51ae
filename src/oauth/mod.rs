//! OAuth2 token lifecycle for one STH service.
//!
//! Implements the authorization code flow:
//! 1. `begin_authorization` → redirect URL with a fresh `state`
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to the callback with `code` and `state`
//! 4. `complete_callback` consumes the state and exchanges the code
//! 5. The token is held in memory and persisted to the credential store
//!
//! Refresh is caller-driven: there is no background timer. Callers invoke
//! `ensure_fresh` before each request.

mod client;
mod state;

use client::OAuthClient;
use state::PendingStates;

use crate::config::OAuthConfig;
use crate::credentials::{CredentialStore, Token};
use crate::error::{Error, Result};
use chrono::{Duration, Utc};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Owns the OAuth client and the current token for one service.
pub struct TokenManager {
    id: String,
    client: OAuthClient,
    store: Arc<dyn CredentialStore>,
    token: RwLock<Option<Arc<Token>>>,
    pending: PendingStates,
}

impl TokenManager {
    /// Creates a manager with no token.
    pub fn new(id: &str, config: OAuthConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            id: id.to_string(),
            client: OAuthClient::new(config),
            store,
            token: RwLock::new(None),
            pending: PendingStates::default(),
        }
    }

    /// Creates a manager and restores any token previously persisted for `id`.
    pub fn load(id: &str, config: OAuthConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let manager = Self::new(id, config, store);

        if let Some(token) = manager.store.get(id)? {
            debug!(service = %id, "Restored stored token");
            manager.replace(token);
        }

        Ok(manager)
    }

    /// Builds the provider redirect URL for a new authorization attempt.
    ///
    /// `callback_uri` is recorded with the generated state and reused for the
    /// code exchange.
    pub fn begin_authorization(&self, callback_uri: &str) -> Result<String> {
        self.client.check_authorize_config()?;

        let state = self.pending.create(callback_uri);
        let url = self.client.authorize_url(&state, callback_uri)?;

        info!(service = %self.id, "Starting OAuth authorization");
        Ok(url)
    }

    /// True if `state` belongs to an attempt started by this manager.
    pub fn owns_state(&self, state: &str) -> bool {
        self.pending.contains(state)
    }

    /// Completes an attempt identified by `state` with the provider's `code`.
    pub async fn complete_callback(&self, state: &str, code: &str) -> Result<Token> {
        let attempt = self.pending.consume(state).ok_or_else(|| {
            warn!(service = %self.id, "Invalid or expired OAuth state");
            Error::InvalidState
        })?;

        self.complete_authorization(code, &attempt.redirect_uri).await
    }

    /// Exchanges `code` for a token and stores it, replacing any prior token.
    pub async fn complete_authorization(&self, code: &str, redirect_uri: &str) -> Result<Token> {
        let token = self.client.exchange_code(code, redirect_uri).await?;
        self.install(token.clone())?;

        info!(
            service = %self.id,
            has_refresh_token = token.refresh_token.is_some(),
            "OAuth authorization completed"
        );
        Ok(token)
    }

    /// Obtains a new token with the stored refresh token.
    ///
    /// Fails without touching the network when nothing is stored or the
    /// stored token carries no refresh token.
    pub async fn refresh(&self) -> Result<Token> {
        let current = self.current().ok_or(Error::NoToken)?;
        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            Error::AuthExchange("stored token has no refresh token".to_string())
        })?;

        info!(service = %self.id, "Refreshing OAuth token");

        let mut token = self.client.refresh(&refresh_token).await?;

        // Keep the existing refresh token if the provider did not rotate it
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token);
        }

        self.install(token.clone())?;

        info!(service = %self.id, "OAuth token refreshed");
        Ok(token)
    }

    /// The current access token, if any.
    pub fn current_access_token(&self) -> Option<String> {
        self.current().map(|t| t.access_token.clone())
    }

    /// A snapshot of the current token.
    pub fn current(&self) -> Option<Arc<Token>> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn needs_refresh(&self, margin: Duration) -> bool {
        self.current()
            .map(|t| t.needs_refresh(Utc::now(), margin))
            .unwrap_or(false)
    }

    /// Refreshes the token if it is within `margin` of expiry.
    ///
    /// Returns the new token when a refresh happened.
    pub async fn ensure_fresh(&self, margin: Duration) -> Result<Option<Token>> {
        if !self.needs_refresh(margin) {
            return Ok(None);
        }

        self.refresh().await.map(Some)
    }

    /// Persists first, then swaps in memory, so a store failure leaves the
    /// previous token in place.
    fn install(&self, token: Token) -> Result<()> {
        self.store.put(&self.id, &token)?;
        self.replace(token);
        Ok(())
    }

    fn replace(&self, token: Token) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(token));
    }
}
