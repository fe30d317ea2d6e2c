//! HTTP command handlers
//!
//! Handlers are grouped by concern: video catalog, download jobs and
//! system endpoints. Every handler returns [`AppResult`]; errors become a
//! JSON `{success: false, error}` body with a matching status code.

pub mod download;
pub mod system;
pub mod videos;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{error, warn};

use crate::core::error_handling::ErrorCategory;
use crate::core::models::{AppError, Identity};
use crate::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ENTITLED_HEADER: &str = "x-user-entitled";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Build the service router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/api/system/encoder", get(system::encoder_info))
        .route("/api/quota", get(system::quota))
        .route("/api/admin/quota/{user_id}/reset", post(system::reset_quota))
        .route("/api/videos", post(videos::create_video).get(videos::list_videos))
        .route(
            "/api/videos/{id}",
            get(videos::get_video).delete(videos::delete_video),
        )
        .route("/api/videos/{id}/link", get(videos::direct_link))
        .route(
            "/api/downloads/{id}",
            post(download::start_download)
                .get(download::download_status)
                .delete(download::cancel_download),
        )
        .route("/api/downloads/{id}/restart", post(download::restart_download))
        .route("/api/downloads/{id}/file", get(download::download_file))
        .with_state(state)
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Pipeline(e) if e.category() == ErrorCategory::Unsupported => {
                StatusCode::BAD_REQUEST
            }
            AppError::Config(_) | AppError::Pipeline(_) | AppError::Io(_) | AppError::System(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected ({}): {}", status.as_u16(), self);
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

/// Caller identity from the gateway headers; a missing user id is a 401
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity_from_headers(&parts.headers)
    }
}

pub fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, AppError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Unauthorized("missing user identity".to_string()))?;

    let entitled = headers
        .get(ENTITLED_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| {
            matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
        });

    Ok(Identity {
        user_id: user_id.to_string(),
        entitled,
    })
}

/// Admin routes are off unless `server.admin_token` is configured
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.config.server.admin_token.as_deref() else {
        return Err(AppError::Forbidden("admin routes are disabled".to_string()));
    };
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing admin token".to_string()))?;
    if provided != expected {
        return Err(AppError::Unauthorized("invalid admin token".to_string()));
    }
    Ok(())
}
