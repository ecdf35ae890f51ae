use super::{AppError, AppState};
use crate::history::{HistoryResult, ResponseFormat};
use crate::service::HistoryRequest;
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use tracing::{debug, warn};

/// Create history API router
pub fn create_history_router(state: AppState) -> Router {
    Router::new()
        .route("/api/services/:id/history", get(get_history))
        .with_state(state)
}

/// Trigger response
#[derive(Debug, Serialize)]
struct HistoryResponse {
    #[serde(rename = "statusCode")]
    status_code: u16,
    payload: String,
    format: ResponseFormat,
}

impl HistoryResponse {
    /// `txt` passes the body through as a string and fails on invalid UTF-8;
    /// `bin` base64-encodes the exact bytes.
    fn render(result: HistoryResult, format: ResponseFormat) -> Result<Self, AppError> {
        let payload = match format {
            ResponseFormat::Text => result
                .text()
                .ok_or_else(|| AppError::BadGateway {
                    message: "STH response is not valid UTF-8, request format=bin".to_string(),
                    upstream_status: Some(result.status_code),
                })?
                .to_string(),
            ResponseFormat::Binary => BASE64.encode(&result.body),
        };

        Ok(Self {
            status_code: result.status_code,
            payload,
            format,
        })
    }
}

/// GET /api/services/:id/history?entity_id=X[&entity_type&attribute&last_n&period_ms&format]
///
/// Runs one history query against the service, refreshing its token first
/// if it is close to expiry. Returns `{"statusCode": 200, "payload": "<body>",
/// "format": "txt"}`, or the base64 body with `"format": "bin"`.
async fn get_history(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    Query(request): Query<HistoryRequest>,
) -> Result<Json<HistoryResponse>, AppError> {
    let service = state.services.get(&service_id).ok_or_else(|| {
        AppError::NotFound(format!("Service '{}' not found", service_id))
    })?;

    debug!(service = %service_id, entity = ?request.entity_id, "History query requested");

    let format = request.format_or(service.defaults());
    let result = service.query(&request).await.map_err(|e| {
        warn!(service = %service_id, error = %e, "History query failed");
        AppError::from(e)
    })?;

    HistoryResponse::render(result, format).map(Json)
}
