//! Pipeline error taxonomy and retry policy
//!
//! Every stage of the download pipeline reports a [`PipelineError`]. Errors
//! carry enough classification for the retry executor to decide whether an
//! attempt is worth repeating: transport failures, 5xx and 429 are retried
//! with exponential backoff and jitter, while client errors (expired signed
//! URLs answer 403/404/410) fail immediately.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::utils::validation::redact_query;

/// Default base delay for exponential backoff (250ms)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);

/// Maximum delay cap for exponential backoff (10 seconds)
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(10);

/// Broad error categories, used for logging and API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// DNS, connection, timeouts, 5xx
    Network,
    /// The remote answered with a client error (expired or forbidden URL)
    Protocol,
    /// Malformed or empty playlists
    Parsing,
    /// Encoder failures and missing output
    Encoding,
    /// Streams this service deliberately does not handle
    Unsupported,
    FileSystem,
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("manifest fetch failed for {}: {reason}{}", redact_query(.url), status_suffix(.status))]
    ManifestFetch {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("segment {index} fetch failed ({}): {reason}{}", redact_query(.url), status_suffix(.status))]
    SegmentFetch {
        index: usize,
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("mux failed: {0}")]
    Mux(String),

    #[error("unsupported stream: {0}")]
    Unsupported(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

fn status_is_retryable(status: Option<u16>) -> bool {
    match status {
        // No status means the request never completed
        None => true,
        Some(code) => code == 429 || code >= 500,
    }
}

impl PipelineError {
    /// Build a manifest fetch error from a transport failure
    pub fn manifest_transport(url: &str, err: &reqwest::Error) -> Self {
        Self::ManifestFetch {
            url: url.to_string(),
            status: err.status().map(|s| s.as_u16()),
            reason: transport_reason(err),
        }
    }

    /// Build a segment fetch error from a transport failure
    pub fn segment_transport(index: usize, url: &str, err: &reqwest::Error) -> Self {
        Self::SegmentFetch {
            index,
            url: url.to_string(),
            status: err.status().map(|s| s.as_u16()),
            reason: transport_reason(err),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ManifestFetch { status, .. } => status_is_retryable(*status),
            Self::SegmentFetch { status, .. } => status_is_retryable(*status),
            Self::ManifestParse(_)
            | Self::Mux(_)
            | Self::Unsupported(_)
            | Self::Cancelled
            | Self::Io(_) => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ManifestFetch { status, .. } | Self::SegmentFetch { status, .. } => {
                if status_is_retryable(*status) {
                    ErrorCategory::Network
                } else {
                    ErrorCategory::Protocol
                }
            }
            Self::ManifestParse(_) => ErrorCategory::Parsing,
            Self::Mux(_) => ErrorCategory::Encoding,
            Self::Unsupported(_) => ErrorCategory::Unsupported,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Io(_) => ErrorCategory::FileSystem,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

fn transport_reason(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}

/// Bounded retry strategy for individual HTTP fetches
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_DELAY_CAP,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw_ms = self.base_delay.as_millis() as f64 * exp;
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        let jitter = capped_ms * self.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_millis((capped_ms + jitter).max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or `token` is cancelled.
    pub async fn run<F, Fut, T>(&self, token: &CancellationToken, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 1;
        loop {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let result = tokio::select! {
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                result = op(attempt) => result,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() || attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.max_attempts, err, delay
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(PipelineError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
