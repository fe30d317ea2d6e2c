//! Download Manager - background job orchestration
//!
//! One manager per process. It guarantees at most one running job per video,
//! coalesces duplicate start requests, and owns the cleanup rules: partial
//! output is deleted on failure and cancellation, scratch directories are
//! removed after every job, and `ready` always means a complete file.

use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::catalog::VideoCatalog;
use crate::core::encoder::MediaInspector;
use crate::core::error_handling::PipelineError;
use crate::core::job_store::{put_or_warn, JobStore};
use crate::core::models::{clamp_running_progress, AppError, AppResult, JobState, JobStatus};
use crate::core::progress::ProgressCallback;
use crate::core::runner::{JobContext, JobRunner};
use crate::utils::file_utils::{is_non_empty_file, remove_dir_if_exists, remove_file_if_exists, sanitize_filename};

/// Smallest progress increase worth a store write
const PROGRESS_STEP: f64 = 0.1;

/// Filesystem locations of finished and in-progress downloads
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub library_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl JobPaths {
    pub fn output_path(&self, key: &str) -> PathBuf {
        self.library_dir
            .join(format!("{}.mp4", sanitize_filename(key)))
    }

    pub fn scratch_dir(&self, key: &str) -> PathBuf {
        self.temp_dir.join(sanitize_filename(key))
    }
}

/// Result of a start request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "state", rename_all = "snake_case")]
pub enum StartOutcome {
    /// A new job was spawned
    Started(JobState),
    /// A job for this key was already running; nothing was spawned
    AlreadyRunning(JobState),
    /// The file is already downloaded
    AlreadyReady(JobState),
}

impl StartOutcome {
    pub fn state(&self) -> &JobState {
        match self {
            Self::Started(s) | Self::AlreadyRunning(s) | Self::AlreadyReady(s) => s,
        }
    }

    pub fn is_fresh_start(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

struct ActiveJob {
    generation: Uuid,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DownloadManager {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    catalog: Arc<dyn VideoCatalog>,
    /// Reads duration and resolution off finished files
    inspector: Option<Arc<dyn MediaInspector>>,
    paths: JobPaths,
    active: Arc<DashMap<String, ActiveJob>>,
    /// Serializes start, cancel and restart
    ops: Mutex<()>,
}

impl DownloadManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn JobRunner>,
        catalog: Arc<dyn VideoCatalog>,
        paths: JobPaths,
    ) -> Self {
        info!("Download manager using the {} runner", runner.name());
        Self {
            store,
            runner,
            catalog,
            inspector: None,
            paths,
            active: Arc::new(DashMap::new()),
            ops: Mutex::new(()),
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn MediaInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    pub fn runner_name(&self) -> &'static str {
        self.runner.name()
    }

    /// Current state of `key`; `idle` when unknown.
    ///
    /// A `ready` entry whose file has vanished reads back as `idle`.
    pub async fn status(&self, key: &str) -> JobState {
        let state = self.store.get(key).await;
        if state.status == JobStatus::Ready && !is_non_empty_file(&self.paths.output_path(key)).await {
            debug!("Ready file for {} is missing; reporting idle", key);
            return JobState::idle();
        }
        state
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active
            .get(key)
            .map_or(false, |job| !job.handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.active
            .iter()
            .filter(|job| !job.handle.is_finished())
            .count()
    }

    /// Path of the finished file, if the job is ready
    pub async fn ready_file(&self, key: &str) -> Option<PathBuf> {
        let state = self.status(key).await;
        (state.status == JobStatus::Ready).then(|| self.paths.output_path(key))
    }

    /// Start a download for `key` unless one is running or already finished
    #[instrument(skip(self))]
    pub async fn start(&self, key: &str) -> AppResult<StartOutcome> {
        let _ops = self.ops.lock().await;
        self.start_locked(key, false).await
    }

    /// Cancel any running job for `key`, then start a fresh one
    #[instrument(skip(self))]
    pub async fn restart(&self, key: &str) -> AppResult<StartOutcome> {
        let _ops = self.ops.lock().await;
        self.cancel_locked(key).await?;
        self.start_locked(key, true).await
    }

    /// Stop the job for `key` and discard partial output. Idempotent.
    #[instrument(skip(self))]
    pub async fn cancel(&self, key: &str) -> AppResult<JobState> {
        let _ops = self.ops.lock().await;
        self.cancel_locked(key).await
    }

    /// Cancel the job and forget everything about `key`, including a finished file
    #[instrument(skip(self))]
    pub async fn purge(&self, key: &str) -> AppResult<()> {
        let _ops = self.ops.lock().await;
        self.cancel_locked(key).await?;
        remove_file_if_exists(&self.paths.output_path(key)).await?;
        self.store.remove(key).await
    }

    /// Cancel every running job; used on shutdown
    pub async fn shutdown(&self) {
        let _ops = self.ops.lock().await;
        let keys: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Err(e) = self.cancel_locked(&key).await {
                warn!("Failed to cancel {} during shutdown: {}", key, e);
            }
        }
    }

    async fn start_locked(&self, key: &str, force: bool) -> AppResult<StartOutcome> {
        if self.is_active(key) {
            debug!("Job for {} already running; coalescing start", key);
            return Ok(StartOutcome::AlreadyRunning(self.store.get(key).await));
        }
        self.active.remove(key);

        let output_path = self.paths.output_path(key);
        if !force {
            let current = self.store.get(key).await;
            if current.status == JobStatus::Ready && is_non_empty_file(&output_path).await {
                return Ok(StartOutcome::AlreadyReady(current));
            }
        }

        let video = self
            .catalog
            .get(key)
            .await
            .ok_or_else(|| AppError::NotFound(format!("video {}", key)))?;

        let scratch_dir = self.paths.scratch_dir(key);
        remove_file_if_exists(&output_path).await?;
        remove_dir_if_exists(&scratch_dir).await?;

        let initial = JobState::downloading(0.0);
        self.store.put(key, initial.clone()).await?;

        let generation = Uuid::new_v4();
        let token = CancellationToken::new();
        let ctx = JobContext {
            key: key.to_string(),
            stream_url: video.stream_url,
            duration_hint: video.duration_secs,
            output_path,
            scratch_dir,
            token: token.clone(),
        };

        let handle = tokio::spawn(run_job(
            self.store.clone(),
            self.runner.clone(),
            self.active.clone(),
            self.catalog.clone(),
            self.inspector.clone(),
            ctx,
            generation,
        ));

        self.active.insert(
            key.to_string(),
            ActiveJob {
                generation,
                token,
                handle,
            },
        );
        info!("Started {} job {} for {}", self.runner.name(), generation, key);
        Ok(StartOutcome::Started(initial))
    }

    async fn cancel_locked(&self, key: &str) -> AppResult<JobState> {
        if let Some((_, job)) = self.active.remove(key) {
            info!("Cancelling job {} for {}", job.generation, key);
            job.token.cancel();
            if let Err(e) = job.handle.await {
                error!("Job task for {} ended abnormally: {}", key, e);
            }
        }

        let output_path = self.paths.output_path(key);
        let state = self.store.get(key).await;
        if state.status == JobStatus::Ready && is_non_empty_file(&output_path).await {
            // Finished before the cancel arrived; the file is complete
            return Ok(state);
        }

        remove_file_if_exists(&output_path).await?;
        remove_dir_if_exists(&self.paths.scratch_dir(key)).await?;
        if state.status != JobStatus::Idle {
            self.store.put(key, JobState::idle()).await?;
        }
        Ok(JobState::idle())
    }
}

/// Body of a spawned job: drives the runner, folds its progress into the
/// store and applies the terminal state.
async fn run_job(
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    active: Arc<DashMap<String, ActiveJob>>,
    catalog: Arc<dyn VideoCatalog>,
    inspector: Option<Arc<dyn MediaInspector>>,
    ctx: JobContext,
    generation: Uuid,
) {
    let key = ctx.key.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<f64>();
    let progress: ProgressCallback = Arc::new(move |p| {
        let _ = tx.send(p);
    });

    let result = {
        let run = runner.run(&ctx, progress);
        tokio::pin!(run);
        let mut last = 0.0;

        loop {
            tokio::select! {
                result = &mut run => break result,
                Some(p) = rx.recv() => {
                    let p = clamp_running_progress(p);
                    if p >= last + PROGRESS_STEP && !ctx.token.is_cancelled() {
                        last = p;
                        put_or_warn(store.as_ref(), &key, JobState::downloading(p)).await;
                    }
                }
            }
        }
    };

    let result = match result {
        Ok(()) if !ctx.token.is_cancelled() => {
            if is_non_empty_file(&ctx.output_path).await {
                Ok(())
            } else {
                Err(PipelineError::Mux(
                    "runner finished without producing a file".to_string(),
                ))
            }
        }
        Ok(()) => Err(PipelineError::Cancelled),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            info!("Download {} ready at {:?}", key, ctx.output_path);
            put_or_warn(store.as_ref(), &key, JobState::ready()).await;
            if let Some(inspector) = inspector {
                record_media_info(inspector.as_ref(), catalog.as_ref(), &key, &ctx.output_path).await;
            }
        }
        Err(err) => {
            discard_partial(&ctx.output_path).await;
            if err.is_cancelled() {
                info!("Download {} cancelled", key);
                put_or_warn(store.as_ref(), &key, JobState::idle()).await;
            } else {
                warn!("Download {} failed ({:?}): {}", key, err.category(), err);
                put_or_warn(store.as_ref(), &key, JobState::failed(err.to_string())).await;
            }
        }
    }

    if let Err(e) = remove_dir_if_exists(&ctx.scratch_dir).await {
        warn!("Failed to remove scratch dir {:?}: {}", ctx.scratch_dir, e);
    }

    active.remove_if(&key, |_, job| job.generation == generation);
}

/// Write measured duration, size and resolution back to the catalog.
/// Failures are logged; the download stays `ready`.
async fn record_media_info(
    inspector: &dyn MediaInspector,
    catalog: &dyn VideoCatalog,
    key: &str,
    output_path: &Path,
) {
    let info = match inspector.inspect(output_path).await {
        Ok(info) => info,
        Err(e) => {
            warn!("Could not read media info of {:?}: {}", output_path, e);
            return;
        }
    };
    match catalog.record_media_info(key, &info).await {
        Ok(video) => debug!(
            "Recorded media info for {}: {:?}s, {} bytes, {:?}",
            key, video.duration_secs, info.size_bytes, video.resolution
        ),
        Err(e) => warn!("Failed to record media info for {}: {}", key, e),
    }
}

async fn discard_partial(path: &Path) {
    match remove_file_if_exists(path).await {
        Ok(true) => debug!("Removed partial output {:?}", path),
        Ok(false) => {}
        Err(e) => warn!("Failed to remove partial output {:?}: {}", path, e),
    }
}
