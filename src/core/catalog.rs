//! Video catalog
//!
//! Stores the user-submitted stream pointers the download jobs are keyed on.
//! The hosted metadata database of a full deployment sits behind the
//! [`VideoCatalog`] trait; [`LocalCatalog`] keeps records in memory with an
//! optional JSON snapshot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::core::config::CatalogConfig;
use crate::core::models::{AppError, AppResult, MediaInfo, NewVideo, Video};
use crate::utils::file_utils::write_json_atomic;
use crate::utils::validation::{redact_query, validate_stream_url};

const DEFAULT_TITLE: &str = "Video";
const SHAREABLE_ID_LEN: usize = 8;

#[async_trait]
pub trait VideoCatalog: Send + Sync {
    /// Validate and store a new video owned by `owner`
    async fn create(&self, owner: &str, video: NewVideo) -> AppResult<Video>;

    async fn get(&self, id: &str) -> Option<Video>;

    /// Videos owned by `user_id`, newest first
    async fn list_for(&self, user_id: &str) -> Vec<Video>;

    /// Remove a video; only its owner may do so
    async fn delete(&self, id: &str, user_id: &str) -> AppResult<Video>;

    /// Bump the view counter and return the updated record
    async fn record_view(&self, id: &str) -> AppResult<Video>;

    async fn record_download(&self, id: &str) -> AppResult<()>;

    /// Store what was measured on a finished export
    async fn record_media_info(&self, id: &str, info: &MediaInfo) -> AppResult<Video>;
}

/// Mux playback id: last path segment without the `.m3u8` suffix
pub fn playback_id(stream_url: &str) -> Option<String> {
    let parsed = Url::parse(stream_url).ok()?;
    let last = parsed.path_segments()?.last()?;
    let id = last.strip_suffix(".m3u8").unwrap_or(last);
    (!id.is_empty()).then(|| id.to_string())
}

pub fn thumbnail_url(base: &str, playback_id: &str) -> String {
    format!(
        "{}/{}/thumbnail.jpg?width=160&height=120&time=1",
        base.trim_end_matches('/'),
        playback_id
    )
}

/// Static MP4 rendition of a Mux stream: same URL with `.m3u8` swapped for
/// `.mp4`; the signing query is kept.
pub fn direct_mp4_link(stream_url: &str) -> AppResult<String> {
    let mut parsed =
        Url::parse(stream_url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let path = parsed.path().to_string();
    let stem = path.strip_suffix(".m3u8").ok_or_else(|| {
        AppError::Validation("stream URL does not reference an .m3u8 playlist".to_string())
    })?;
    parsed.set_path(&format!("{}.mp4", stem));
    Ok(parsed.to_string())
}

/// Short public id derived from the record id
pub fn shareable_id_from(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(SHAREABLE_ID_LEN)
        .collect()
}

pub struct LocalCatalog {
    config: CatalogConfig,
    videos: DashMap<String, Video>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl LocalCatalog {
    /// Memory-only catalog
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            config,
            videos: DashMap::new(),
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Catalog snapshotted to `path`, loading existing records
    pub async fn open(config: CatalogConfig, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let videos = DashMap::new();

        if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read catalog: {:?}", path))?;
            if !content.trim().is_empty() {
                let stored: BTreeMap<String, Video> = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse catalog: {:?}", path))?;
                for (id, video) in stored {
                    videos.insert(id, video);
                }
            }
        }

        info!("Loaded {} videos from {:?}", videos.len(), path);
        Ok(Self {
            config,
            videos,
            path: Some(path),
            write_lock: Mutex::new(()),
        })
    }

    /// Store a prepared record as-is
    pub async fn insert(&self, video: Video) -> AppResult<()> {
        self.videos.insert(video.id.clone(), video);
        self.persist().await
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    async fn persist(&self) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let snapshot: BTreeMap<String, Video> = self
            .videos
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        write_json_atomic(path, &snapshot).await?;
        debug!("Persisted {} videos to {:?}", snapshot.len(), path);
        Ok(())
    }

    fn update<F>(&self, id: &str, apply: F) -> AppResult<Video>
    where
        F: FnOnce(&mut Video),
    {
        let mut entry = self
            .videos
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("video {}", id)))?;
        apply(entry.value_mut());
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl VideoCatalog for LocalCatalog {
    async fn create(&self, owner: &str, video: NewVideo) -> AppResult<Video> {
        let url = validate_stream_url(
            &video.stream_url,
            &self.config.allowed_hosts,
            self.config.allow_insecure,
        )
        .map_err(|e| AppError::Validation(e.to_string()))?;

        if let Some(d) = video.duration_secs {
            if !d.is_finite() || d < 0.0 {
                return Err(AppError::Validation(format!("Invalid duration: {}", d)));
            }
        }

        let stream_url = url.to_string();
        let id = Uuid::new_v4().to_string();
        let title = video
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());

        let record = Video {
            shareable_id: shareable_id_from(&id),
            user_id: owner.to_string(),
            title,
            duration_secs: video.duration_secs,
            thumbnail_url: playback_id(&stream_url)
                .map(|pid| thumbnail_url(&self.config.thumbnail_base, &pid)),
            stream_url,
            created_at: Utc::now(),
            view_count: 0,
            download_count: 0,
            file_size: None,
            resolution: None,
            id,
        };

        info!(
            "Created video {} for {} ({})",
            record.id,
            owner,
            redact_query(&record.stream_url)
        );
        self.insert(record.clone()).await?;
        Ok(record)
    }

    async fn get(&self, id: &str) -> Option<Video> {
        self.videos.get(id).map(|entry| entry.value().clone())
    }

    async fn list_for(&self, user_id: &str) -> Vec<Video> {
        let mut videos: Vec<Video> = self
            .videos
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        videos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        videos
    }

    async fn delete(&self, id: &str, user_id: &str) -> AppResult<Video> {
        let removed = self
            .videos
            .remove_if(id, |_, video| video.user_id == user_id);

        match removed {
            Some((_, video)) => {
                self.persist().await?;
                info!("Deleted video {}", id);
                Ok(video)
            }
            None if self.videos.contains_key(id) => Err(AppError::Forbidden(format!(
                "video {} belongs to another user",
                id
            ))),
            None => Err(AppError::NotFound(format!("video {}", id))),
        }
    }

    async fn record_view(&self, id: &str) -> AppResult<Video> {
        let video = self.update(id, |v| v.view_count = v.view_count.saturating_add(1))?;
        self.persist().await?;
        Ok(video)
    }

    async fn record_download(&self, id: &str) -> AppResult<()> {
        self.update(id, |v| v.download_count = v.download_count.saturating_add(1))?;
        self.persist().await
    }

    async fn record_media_info(&self, id: &str, info: &MediaInfo) -> AppResult<Video> {
        let video = self.update(id, |v| {
            if let Some(d) = info.duration_secs.filter(|d| d.is_finite() && *d > 0.0) {
                v.duration_secs = Some(d);
            }
            v.file_size = Some(info.size_bytes);
            if let Some(r) = info.resolution() {
                v.resolution = Some(r);
            }
        })?;
        self.persist().await?;
        Ok(video)
    }
}
