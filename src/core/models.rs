//! Core data models for the download service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error_handling::PipelineError;

/// Highest progress value reported while a job is still running
pub const MAX_RUNNING_PROGRESS: f64 = 99.5;

/// Download job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Downloading,
    Ready,
    Error,
}

/// Snapshot of one download job, keyed by video id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    pub status: JobStatus,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for JobState {
    fn default() -> Self {
        Self::idle()
    }
}

impl JobState {
    pub fn idle() -> Self {
        Self {
            status: JobStatus::Idle,
            progress: 0.0,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Running state; progress is clamped into `[0, 99.5]`
    pub fn downloading(progress: f64) -> Self {
        Self {
            status: JobStatus::Downloading,
            progress: clamp_running_progress(progress),
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn ready() -> Self {
        Self {
            status: JobStatus::Ready,
            progress: 100.0,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            progress: 0.0,
            error: Some(message.into()),
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Ready | JobStatus::Error)
    }
}

pub fn clamp_running_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        return 0.0;
    }
    progress.clamp(0.0, MAX_RUNNING_PROGRESS)
}

/// A user-submitted pointer to a signed HLS stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Video {
    pub id: String,
    pub user_id: String,
    pub shareable_id: String,
    pub title: String,
    pub duration_secs: Option<f64>,
    pub thumbnail_url: Option<String>,
    pub stream_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub download_count: u64,
    /// Size of the last completed MP4 export
    #[serde(default)]
    pub file_size: Option<u64>,
    /// `WIDTHxHEIGHT` of the exported video stream
    #[serde(default)]
    pub resolution: Option<String>,
}

/// Facts read back from a finished MP4
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_secs: Option<f64>,
    pub size_bytes: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl MediaInfo {
    pub fn resolution(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{}x{}", w, h)),
            _ => None,
        }
    }
}

/// Body of `POST /api/videos`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVideo {
    pub stream_url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

/// Caller identity as forwarded by the upstream gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    /// Paid membership; bypasses quota limits
    pub entitled: bool,
}

/// Lifetime usage counters for one user
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaUsage {
    pub uploads: u64,
    pub downloads: u64,
}

/// Usage plus the limits that apply to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaView {
    pub uploads: u64,
    pub downloads: u64,
    /// `None` when the caller is entitled
    pub upload_limit: Option<u64>,
    pub download_limit: Option<u64>,
    pub entitled: bool,
}

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Download error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System error: {0}")]
    System(String),
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_constructors() {
        let idle = JobState::default();
        assert_eq!(idle.status, JobStatus::Idle);
        assert_eq!(idle.progress, 0.0);

        assert_eq!(JobState::downloading(140.0).progress, MAX_RUNNING_PROGRESS);
        assert_eq!(JobState::downloading(-3.0).progress, 0.0);
        assert_eq!(JobState::downloading(f64::NAN).progress, 0.0);
        assert_eq!(JobState::ready().progress, 100.0);

        let failed = JobState::failed("manifest fetch failed");
        assert!(failed.is_terminal());
        assert_eq!(failed.error.as_deref(), Some("manifest fetch failed"));
    }

    #[test]
    fn test_job_status_serialization() {
        let json = serde_json::to_value(JobState::downloading(42.0)).unwrap();
        assert_eq!(json["status"], "downloading");
        assert_eq!(json["progress"], 42.0);
        assert!(json.get("error").is_none());

        let status: JobStatus = serde_json::from_str("\"ready\"").unwrap();
        assert_eq!(status, JobStatus::Ready);
    }
}
