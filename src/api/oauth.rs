//! Browser-facing OAuth endpoints.
//!
//! 1. The editor opens `GET /sthServer/login/auth?service=<id>&callback=<uri>`
//! 2. The user is redirected to the provider and authorizes
//! 3. The provider redirects to `GET /sthServer/login/callback?code=..&state=..`
//! 4. The code is exchanged and the token stored for the owning service

use super::AppState;
use crate::error::Error;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

const LOGIN_PATH: &str = "/sthServer/login/auth";
const CALLBACK_PATH: &str = "/sthServer/login/callback";

const SUCCESS_PAGE: &str = "<html><head></head><body><p>Authorised - you can close this window and return to the editor</p></body></html>";
const FAILURE_PAGE: &str = "<html><head></head><body><p>Something went wrong with the authentication process</p></body></html>";

/// Query parameters of the login endpoint
#[derive(Deserialize)]
pub struct LoginParams {
    service: Option<String>,
    callback: Option<String>,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Create OAuth API router
pub fn create_oauth_router(state: AppState) -> Router {
    Router::new()
        .route(LOGIN_PATH, get(oauth_login))
        .route(CALLBACK_PATH, get(oauth_callback))
        .with_state(state)
}

fn page(status: StatusCode, body: &'static str) -> Response {
    (status, Html(body)).into_response()
}

/// GET /sthServer/login/auth?service=<id>&callback=<uri>
///
/// Starts an authorization attempt for the service and redirects the browser
/// to the provider. `callback` must be the public URL of the callback
/// endpoint; it is sent to the provider as `redirect_uri`.
async fn oauth_login(State(state): State<AppState>, Query(params): Query<LoginParams>) -> Response {
    let Some(service_id) = params.service else {
        return (StatusCode::BAD_REQUEST, "Missing 'service' parameter").into_response();
    };
    let Some(callback) = params.callback.filter(|c| !c.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing 'callback' parameter").into_response();
    };

    let Some(service) = state.services.get(&service_id) else {
        warn!(service = %service_id, "OAuth login for unknown service");
        return (
            StatusCode::NOT_FOUND,
            format!("Service '{}' not found", service_id),
        )
            .into_response();
    };

    match service.tokens().begin_authorization(&callback) {
        Ok(url) => {
            debug!(service = %service_id, "Redirecting to OAuth provider");
            Redirect::temporary(&url).into_response()
        }
        Err(e) => {
            error!(service = %service_id, error = %e, "Cannot start OAuth authorization");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /sthServer/login/callback?code=..&state=..
///
/// Validates the single-use state, exchanges the code and stores the token
/// on the service that issued the state.
async fn oauth_callback(
    State(state): State<AppState>,
    Query(callback): Query<OAuthCallback>,
) -> Response {
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "OAuth authorization denied");
        return page(StatusCode::BAD_REQUEST, FAILURE_PAGE);
    }

    let (Some(code), Some(csrf_state)) = (callback.code, callback.state) else {
        warn!("OAuth callback without code or state");
        return page(StatusCode::BAD_REQUEST, FAILURE_PAGE);
    };

    let Some(service) = state.services.find_by_state(&csrf_state) else {
        warn!("OAuth callback with unknown state");
        return page(StatusCode::UNAUTHORIZED, FAILURE_PAGE);
    };

    match service.tokens().complete_callback(&csrf_state, &code).await {
        Ok(_) => {
            info!(service = %service.id(), "OAuth flow completed successfully");
            page(StatusCode::OK, SUCCESS_PAGE)
        }
        Err(Error::InvalidState) => page(StatusCode::UNAUTHORIZED, FAILURE_PAGE),
        Err(e) => {
            error!(service = %service.id(), error = %e, "Token exchange failed");
            page(StatusCode::BAD_GATEWAY, FAILURE_PAGE)
        }
    }
}
