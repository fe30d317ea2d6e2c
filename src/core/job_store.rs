//! Job state storage
//!
//! The manager only talks to [`JobStore`]. The in-memory store loses every
//! job on restart; the JSON file store persists each write and, on load,
//! turns jobs that were still `downloading` into errors because no task
//! survives a restart to finish them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::models::{AppResult, JobState, JobStatus};
use crate::utils::file_utils::write_json_atomic;

/// Message stored for jobs that were running when the process stopped
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stored state, or `idle` for unknown keys
    async fn get(&self, key: &str) -> JobState;

    /// Replace the whole state of `key`
    async fn put(&self, key: &str, state: JobState) -> AppResult<()>;

    async fn remove(&self, key: &str) -> AppResult<()>;

    /// All keys currently holding state
    async fn keys(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, JobState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, key: &str) -> JobState {
        self.jobs
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    async fn put(&self, key: &str, state: JobState) -> AppResult<()> {
        self.jobs.insert(key.to_string(), state);
        Ok(())
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        self.jobs.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Vec<String> {
        self.jobs.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// JSON file backed store; the whole map is rewritten on every change
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    jobs: DashMap<String, JobState>,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    /// Load `path` (if present) and mark interrupted jobs as failed
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let jobs = DashMap::new();
        let mut interrupted = 0usize;

        if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read job store: {:?}", path))?;
            let stored: BTreeMap<String, JobState> = if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse job store: {:?}", path))?
            };

            for (key, mut state) in stored {
                if state.status == JobStatus::Downloading {
                    state = JobState::failed(INTERRUPTED_MESSAGE);
                    interrupted += 1;
                }
                jobs.insert(key, state);
            }
        }

        let store = Self {
            path,
            jobs,
            write_lock: Mutex::new(()),
        };

        info!(
            "Loaded {} jobs from {:?} ({} interrupted)",
            store.jobs.len(),
            store.path,
            interrupted
        );
        if interrupted > 0 {
            store.persist().await.map_err(anyhow::Error::from)?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;

        let snapshot: BTreeMap<String, JobState> = self
            .jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        write_json_atomic(&self.path, &snapshot).await?;

        debug!("Persisted {} jobs to {:?}", snapshot.len(), self.path);
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn get(&self, key: &str) -> JobState {
        self.jobs
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    async fn put(&self, key: &str, state: JobState) -> AppResult<()> {
        self.jobs.insert(key.to_string(), state);
        self.persist().await
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        if self.jobs.remove(key).is_some() {
            self.persist().await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Vec<String> {
        self.jobs.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Log-and-continue wrapper for state writes from background tasks
pub async fn put_or_warn(store: &dyn JobStore, key: &str, state: JobState) {
    if let Err(e) = store.put(key, state).await {
        warn!("Failed to store job state for {}: {}", key, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_unknown_key_is_idle() {
        let store = MemoryJobStore::new();
        let state = store.get("missing").await;
        assert_eq!(state.status, JobStatus::Idle);
        assert_eq!(state.progress, 0.0);
    }

    #[tokio::test]
    async fn test_memory_store_replace_and_remove() {
        let store = MemoryJobStore::new();
        store.put("v1", JobState::downloading(10.0)).await.unwrap();
        store.put("v1", JobState::ready()).await.unwrap();
        assert_eq!(store.get("v1").await.status, JobStatus::Ready);
        assert_eq!(store.keys().await, vec!["v1".to_string()]);

        store.remove("v1").await.unwrap();
        assert_eq!(store.get("v1").await.status, JobStatus::Idle);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("jobs.json");

        {
            let store = FileJobStore::open(&path).await.unwrap();
            store.put("done", JobState::ready()).await.unwrap();
            store.put("broken", JobState::failed("mux failed")).await.unwrap();
        }

        let reopened = FileJobStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("done").await.progress, 100.0);
        assert_eq!(
            reopened.get("broken").await.error.as_deref(),
            Some("mux failed")
        );
    }

    #[tokio::test]
    async fn test_file_store_marks_running_jobs_interrupted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        {
            let store = FileJobStore::open(&path).await.unwrap();
            store.put("running", JobState::downloading(42.0)).await.unwrap();
        }

        let reopened = FileJobStore::open(&path).await.unwrap();
        let state = reopened.get("running").await;
        assert_eq!(state.status, JobStatus::Error);
        assert_eq!(state.error.as_deref(), Some(INTERRUPTED_MESSAGE));

        // The rewrite is persisted, not only applied in memory
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains(INTERRUPTED_MESSAGE));
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(FileJobStore::open(&path).await.is_err());
    }
}
