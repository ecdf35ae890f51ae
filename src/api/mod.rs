// HTTP endpoints: OAuth browser handshake and history trigger

pub mod history;
pub mod oauth;

pub use history::create_history_router;
pub use oauth::create_oauth_router;

use crate::error::Error;
use crate::service::ServiceRegistry;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Shared state for all routers
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ServiceRegistry>,
}

impl AppState {
    pub fn new(services: ServiceRegistry) -> Self {
        Self {
            services: Arc::new(services),
        }
    }
}

/// Both routers merged.
pub fn create_router(state: AppState) -> Router {
    create_oauth_router(state.clone()).merge(create_history_router(state))
}

/// JSON error body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(rename = "statusCode")]
    status_code: Option<u16>,
}

/// Application error types for JSON endpoints
pub(crate) enum AppError {
    BadRequest(String),
    NotFound(String),
    ServerError(String),
    BadGateway {
        message: String,
        upstream_status: Option<u16>,
    },
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidQuery(_) => AppError::BadRequest(err.to_string()),
            Error::Request { status, .. } => AppError::BadGateway {
                message: err.to_string(),
                upstream_status: status,
            },
            Error::AuthExchange(_) | Error::NoToken | Error::InvalidState => {
                AppError::BadGateway {
                    message: err.to_string(),
                    upstream_status: None,
                }
            }
            Error::Config(_) | Error::Store(_) => AppError::ServerError(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, status_code) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            AppError::BadGateway {
                message,
                upstream_status,
            } => (StatusCode::BAD_GATEWAY, message, upstream_status),
        };

        (status, Json(ErrorResponse { error, status_code })).into_response()
    }
}
