//! Download job commands

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::core::manager::StartOutcome;
use crate::core::models::{AppError, AppResult, Identity, JobState, JobStatus};
use crate::core::quota::{QuotaKind, QuotaPermit};
use crate::utils::file_utils::sanitize_filename;
use crate::AppState;

/// Job state as returned to clients
#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<JobState> for DownloadStatus {
    fn from(state: JobState) -> Self {
        Self {
            status: state.status,
            progress: state.progress,
            error: state.error,
        }
    }
}

impl From<&StartOutcome> for DownloadStatus {
    fn from(outcome: &StartOutcome) -> Self {
        outcome.state().clone().into()
    }
}

/// Start (or join) the download for a video.
///
/// Only a fresh start counts against the caller's download quota.
pub async fn start_download(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> AppResult<Json<DownloadStatus>> {
    let current = state.manager.status(&id).await;
    let needs_job = !matches!(current.status, JobStatus::Downloading | JobStatus::Ready);
    let permit = if needs_job {
        Some(state.quota.reserve(&identity, QuotaKind::Download).await?)
    } else {
        None
    };

    let outcome = state.manager.start(&id).await?;
    record_fresh_start(&state, &identity, &id, &outcome, permit).await?;
    Ok(Json((&outcome).into()))
}

/// Cancel any running job for the video and start over
pub async fn restart_download(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> AppResult<Json<DownloadStatus>> {
    let permit = state.quota.reserve(&identity, QuotaKind::Download).await?;

    let outcome = state.manager.restart(&id).await?;
    record_fresh_start(&state, &identity, &id, &outcome, Some(permit)).await?;
    Ok(Json((&outcome).into()))
}

pub async fn download_status(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> Json<DownloadStatus> {
    Json(state.manager.status(&id).await.into())
}

/// Cancel the job; succeeds whether or not one was running
pub async fn cancel_download(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let after = state.manager.cancel(&id).await?;
    debug!("Cancel for {} left state {:?}", id, after.status);
    Ok(Json(json!({ "ok": true })))
}

/// Stream the finished MP4
pub async fn download_file(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let path = state
        .manager
        .ready_file(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no finished download for {}", id)))?;

    let file = File::open(&path)
        .await
        .map_err(|_| AppError::NotFound(format!("no finished download for {}", id)))?;
    let length = file.metadata().await?.len();

    let title = match state.catalog.get(&id).await {
        Some(video) => video.title,
        None => id.clone(),
    };
    let disposition = format!(
        "attachment; filename=\"{}.mp4\"",
        sanitize_filename(&title).replace('"', "_")
    );

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn record_fresh_start(
    state: &AppState,
    identity: &Identity,
    id: &str,
    outcome: &StartOutcome,
    permit: Option<QuotaPermit<'_>>,
) -> AppResult<()> {
    if !outcome.is_fresh_start() {
        return Ok(());
    }
    match permit {
        Some(permit) => permit.commit().await?,
        // Status changed between the read and the start
        None => state.quota.record(&identity.user_id, QuotaKind::Download).await?,
    };
    state.catalog.record_download(id).await?;
    info!("Download of {} started by {}", id, identity.user_id);
    Ok(())
}
