//! System command handlers
//!
//! Liveness, encoder availability and quota endpoints.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::commands::require_admin;
use crate::core::encoder::EncoderInfo;
use crate::core::models::{AppResult, Identity, QuotaView};
use crate::{AppState, NAME, VERSION};

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "name": NAME,
        "version": VERSION,
        "runner": state.manager.runner_name(),
        "active_jobs": state.manager.active_count(),
    }))
}

/// Check whether the configured encoder can be executed
pub async fn encoder_info(State(state): State<AppState>) -> Json<EncoderInfo> {
    let info = state.encoder.probe().await;
    if !info.available {
        tracing::warn!(
            "Encoder {} unavailable: {}",
            info.program,
            info.error.as_deref().unwrap_or("unknown error")
        );
    }
    Json(info)
}

pub async fn quota(State(state): State<AppState>, identity: Identity) -> Json<QuotaView> {
    Json(state.quota.view(&identity))
}

/// Zero a user's counters; requires the admin token
pub async fn reset_quota(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    state.quota.reset(&user_id).await?;
    info!("Admin reset quota for {}", user_id);
    Ok(Json(json!({ "success": true })))
}
