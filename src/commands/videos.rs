//! Video catalog commands

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::core::catalog::direct_mp4_link;
use crate::core::models::{AppError, AppResult, Identity, NewVideo, Video};
use crate::core::quota::QuotaKind;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct DirectLink {
    pub url: String,
    pub title: String,
}

/// Submit a stream URL; counts one upload against the caller's quota
pub async fn create_video(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<NewVideo>,
) -> AppResult<(StatusCode, Json<Video>)> {
    let permit = state.quota.reserve(&identity, QuotaKind::Upload).await?;

    let video = state.catalog.create(&identity.user_id, request).await?;
    permit.commit().await?;

    info!("Video {} submitted by {}", video.id, identity.user_id);
    Ok((StatusCode::CREATED, Json(video)))
}

pub async fn list_videos(State(state): State<AppState>, identity: Identity) -> Json<Vec<Video>> {
    Json(state.catalog.list_for(&identity.user_id).await)
}

/// Fetch one video and count the view
pub async fn get_video(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> AppResult<Json<Video>> {
    Ok(Json(state.catalog.record_view(&id).await?))
}

/// Delete a video (owner only) together with any downloaded file
pub async fn delete_video(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let video = state.catalog.delete(&id, &identity.user_id).await?;

    if let Err(e) = state.manager.purge(&video.id).await {
        warn!("Video {} deleted but its download could not be purged: {}", id, e);
    }
    Ok(Json(json!({ "success": true, "id": video.id })))
}

/// Direct-link strategy: the static MP4 rendition URL, no job involved
pub async fn direct_link(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> AppResult<Json<DirectLink>> {
    let video = state
        .catalog
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("video {}", id)))?;

    Ok(Json(DirectLink {
        url: direct_mp4_link(&video.stream_url)?,
        title: video.title,
    }))
}
