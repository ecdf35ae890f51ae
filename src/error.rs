//! Error types shared by the token manager, the history fetcher and the HTTP API.

use thiserror::Error;

/// Errors returned by sth-bridge operations.
///
/// Every failed operation is independent: an error never leaves the token
/// manager or the fetcher in a partially-updated state.
#[derive(Debug, Error)]
pub enum Error {
    /// Required configuration is missing or malformed (e.g. no port, no URL).
    #[error("configuration error: {0}")]
    Config(String),

    /// The OAuth provider rejected a code exchange or refresh, or the
    /// request to the token endpoint failed.
    #[error("OAuth token exchange failed: {0}")]
    AuthExchange(String),

    /// A refresh was attempted with no stored token.
    #[error("no token stored for this service")]
    NoToken,

    /// The history request returned a non-200 status or failed in transport.
    #[error("history request failed{}: {detail}", status_suffix(.status))]
    Request { status: Option<u16>, detail: String },

    /// The OAuth callback carried an unknown, expired or reused state.
    #[error("invalid or expired OAuth state")]
    InvalidState,

    /// The caller did not supply enough input to build a history query.
    #[error("invalid history query: {0}")]
    InvalidQuery(String),

    /// The credential store could not read or write a token.
    #[error("credential store error: {0}")]
    Store(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" with status {}", code),
        None => String::new(),
    }
}

impl Error {
    /// Upstream HTTP status carried by a `Request` error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Request { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Store(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_display() {
        let err = Error::Request {
            status: Some(404),
            detail: "not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "history request failed with status 404: not found"
        );
        assert_eq!(err.status_code(), Some(404));

        let err = Error::Request {
            status: None,
            detail: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "history request failed: connection refused");
        assert_eq!(err.status_code(), None);
    }

    #[test]
    fn test_non_request_errors_have_no_status() {
        assert_eq!(Error::NoToken.status_code(), None);
        assert_eq!(Error::Config("x".into()).status_code(), None);
    }
}
