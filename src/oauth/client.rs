//! OAuth2 authorization-code client (RFC 6749 §4.1 and §6).
//!
//! One instance per token manager, built once from the service's
//! `OAuthConfig`.

use crate::config::OAuthConfig;
use crate::credentials::Token;
use crate::error::{Error, Result};

/// Client for the provider's authorize and token endpoints.
pub struct OAuthClient {
    config: OAuthConfig,
    http_client: reqwest::Client,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    /// Fails with `Error::Config` unless the fields needed for the browser
    /// redirect are set.
    pub fn check_authorize_config(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("client_id", &self.config.client_id),
            ("auth_server_uri", &self.config.auth_server_uri),
            ("authorize_path", &self.config.authorize_path),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "OAuth not configured: missing {}",
                missing.join(", ")
            )))
        }
    }

    /// Build the browser redirect URL for the authorization-code flow.
    pub fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<String> {
        self.check_authorize_config()?;

        Ok(format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&state={}",
            self.config.authorize_url(),
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state)
        ))
    }

    /// Exchange an authorization code for a token.
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Token> {
        tracing::debug!(
            token_url = %self.config.token_url(),
            "Exchanging authorization code for token"
        );

        self.request_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    /// Obtain a new token using refresh material.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Token> {
        tracing::debug!(token_url = %self.config.token_url(), "Refreshing token");

        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn request_token(&self, grant: &[(&str, &str)]) -> Result<Token> {
        if self.config.auth_server_uri.trim().is_empty() || self.config.token_path.trim().is_empty()
        {
            return Err(Error::Config(
                "OAuth not configured: missing auth_server_uri or token_path".to_string(),
            ));
        }

        let mut form: Vec<(&str, &str)> = grant.to_vec();
        form.push(("client_id", self.config.client_id.as_str()));
        form.push(("client_secret", self.config.client_secret.as_str()));

        let response = self
            .http_client
            .post(self.config.token_url())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::AuthExchange(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(Error::AuthExchange(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::AuthExchange(format!("invalid token response: {}", e)))?;

        let token =
            Token::from_response(raw).map_err(|e| Error::AuthExchange(e.to_string()))?;

        tracing::debug!(
            has_refresh_token = token.refresh_token.is_some(),
            expires_at = ?token.expires_at,
            "Token issued"
        );

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn config_for(base: &str) -> OAuthConfig {
        OAuthConfig {
            client_id: "app-id".to_string(),
            client_secret: "app-secret".to_string(),
            auth_server_uri: base.to_string(),
            authorize_path: "/oauth2/authorize".to_string(),
            token_path: "/oauth2/token".to_string(),
        }
    }

    #[test]
    fn test_authorize_url() {
        let client = OAuthClient::new(config_for("https://idm.example.com"));

        let url = client
            .authorize_url("random_state", "http://localhost:1880/sthServer/login/callback")
            .unwrap();

        assert!(url.starts_with("https://idm.example.com/oauth2/authorize?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=app-id"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A1880%2FsthServer%2Flogin%2Fcallback"
        ));
        assert!(url.contains("state=random_state"));
    }

    #[test]
    fn test_authorize_url_requires_config() {
        let client = OAuthClient::new(OAuthConfig::default());

        match client.authorize_url("s", "http://cb") {
            Err(Error::Config(msg)) => {
                assert!(msg.contains("client_id"));
                assert!(msg.contains("auth_server_uri"));
                assert!(msg.contains("authorize_path"));
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_code() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "the-code".into()),
                Matcher::UrlEncoded("redirect_uri".into(), "http://cb".into()),
                Matcher::UrlEncoded("client_id".into(), "app-id".into()),
                Matcher::UrlEncoded("client_secret".into(), "app-secret".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":3600}"#)
            .create_async()
            .await;

        let client = OAuthClient::new(config_for(&server.url()));
        let token = client.exchange_code("the-code", "http://cb").await.unwrap();

        mock.assert_async().await;
        assert_eq!(token.access_token, "at-1");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
        assert!(token.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_exchange_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth2/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let client = OAuthClient::new(config_for(&server.url()));
        let err = client.exchange_code("bad", "http://cb").await.unwrap_err();

        match err {
            Error::AuthExchange(msg) => assert!(msg.contains("invalid_grant")),
            other => panic!("expected auth exchange error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_grant() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "rt-1".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"at-2","expires_in":3600}"#)
            .create_async()
            .await;

        let client = OAuthClient::new(config_for(&server.url()));
        let token = client.refresh("rt-1").await.unwrap();

        mock.assert_async().await;
        assert_eq!(token.access_token, "at-2");
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_is_auth_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"at","expires_in":9223372036854775807}"#)
            .create_async()
            .await;

        let client = OAuthClient::new(config_for(&server.url()));
        let err = client.exchange_code("code", "http://cb").await.unwrap_err();

        match err {
            Error::AuthExchange(msg) => assert!(msg.contains("expires_in")),
            other => panic!("expected auth exchange error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_token_endpoint() {
        // Port 9 (discard) is not expected to accept HTTP
        let client = OAuthClient::new(config_for("http://127.0.0.1:9"));
        let err = client.refresh("rt").await.unwrap_err();
        assert!(matches!(err, Error::AuthExchange(_)));
    }
}
