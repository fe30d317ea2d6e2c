//! Download manager unit tests
//!
//! Drive the manager with a scripted runner so the state machine can be
//! checked without network or encoder.

use crate::core::catalog::LocalCatalog;
use crate::core::catalog::VideoCatalog;
use crate::core::config::CatalogConfig;
use crate::core::encoder::MediaInspector;
use crate::core::error_handling::PipelineError;
use crate::core::job_store::{JobStore, MemoryJobStore};
use crate::core::manager::{DownloadManager, JobPaths, StartOutcome};
use crate::core::models::{AppError, JobState, JobStatus, MediaInfo, Video};
use crate::core::progress::ProgressCallback;
use crate::core::runner::{JobContext, JobRunner};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

#[derive(Clone, Copy)]
enum Finish {
    Succeed,
    Fail,
}

/// Writes a partial file, reports progress, then waits for the gate
struct ScriptedRunner {
    spawns: AtomicUsize,
    gate: Notify,
    finish: Finish,
}

impl ScriptedRunner {
    fn new(finish: Finish) -> Arc<Self> {
        Arc::new(Self {
            spawns: AtomicUsize::new(0),
            gate: Notify::new(),
            finish,
        })
    }

    fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, ctx: &JobContext, progress: ProgressCallback) -> Result<(), PipelineError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(ctx.output_path.parent().unwrap()).await?;
        tokio::fs::write(&ctx.output_path, b"partial").await?;
        progress(25.0);
        progress(10.0);
        progress(50.0);

        tokio::select! {
            _ = ctx.token.cancelled() => return Err(PipelineError::Cancelled),
            _ = self.gate.notified() => {}
        }

        match self.finish {
            Finish::Succeed => {
                tokio::fs::write(&ctx.output_path, b"complete mp4").await?;
                Ok(())
            }
            Finish::Fail => Err(PipelineError::Mux("encoder exited with status 1".to_string())),
        }
    }
}

/// Reports fixed media facts for whatever file it is given
struct StubInspector {
    info: Option<MediaInfo>,
}

#[async_trait]
impl MediaInspector for StubInspector {
    async fn inspect(&self, path: &Path) -> Result<MediaInfo, PipelineError> {
        assert!(path.exists());
        self.info
            .clone()
            .ok_or_else(|| PipelineError::Mux("moov atom not found".to_string()))
    }
}

struct Harness {
    _dir: TempDir,
    manager: DownloadManager,
    store: Arc<MemoryJobStore>,
    runner: Arc<ScriptedRunner>,
    catalog: Arc<LocalCatalog>,
}

async fn harness(finish: Finish) -> Harness {
    harness_with(finish, None).await
}

async fn harness_with(finish: Finish, inspector: Option<StubInspector>) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let runner = ScriptedRunner::new(finish);
    let catalog = Arc::new(LocalCatalog::new(CatalogConfig::default()));
    catalog
        .insert(Video {
            id: "video-1".to_string(),
            user_id: "owner".to_string(),
            shareable_id: "video1".to_string(),
            title: "Video".to_string(),
            duration_secs: Some(60.0),
            thumbnail_url: None,
            stream_url: "https://stream.mux.com/abc.m3u8?token=t".to_string(),
            created_at: Utc::now(),
            view_count: 0,
            download_count: 0,
            file_size: None,
            resolution: None,
        })
        .await
        .unwrap();

    let paths = JobPaths {
        library_dir: dir.path().join("library"),
        temp_dir: dir.path().join("tmp"),
    };
    let mut manager = DownloadManager::new(store.clone(), runner.clone(), catalog.clone(), paths);
    if let Some(inspector) = inspector {
        manager = manager.with_inspector(Arc::new(inspector));
    }
    Harness {
        _dir: dir,
        manager,
        store,
        runner,
        catalog,
    }
}

/// Poll until the job for `key` has left the active map
async fn wait_finished(manager: &DownloadManager, key: &str) {
    timeout(Duration::from_secs(5), async {
        while manager.is_active(key) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time");
}

async fn wait_progress(manager: &DownloadManager, key: &str, at_least: f64) {
    timeout(Duration::from_secs(5), async {
        while manager.status(key).await.progress < at_least {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("progress was not reported");
}

#[tokio::test]
async fn test_unknown_key_is_idle() {
    let h = harness(Finish::Succeed).await;
    let state = h.manager.status("nope").await;
    assert_eq!(state.status, JobStatus::Idle);
    assert_eq!(state.progress, 0.0);
    assert!(state.error.is_none());
}

#[tokio::test]
async fn test_unknown_video_cannot_start() {
    let h = harness(Finish::Succeed).await;
    let err = h.manager.start("missing").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(h.runner.spawns(), 0);
}

#[tokio::test]
async fn test_double_start_spawns_once() {
    let h = harness(Finish::Succeed).await;

    let first = h.manager.start("video-1").await.unwrap();
    assert!(first.is_fresh_start());
    wait_progress(&h.manager, "video-1", 50.0).await;

    let second = h.manager.start("video-1").await.unwrap();
    assert!(matches!(second, StartOutcome::AlreadyRunning(_)));
    let observed = h.manager.status("video-1").await;
    assert_eq!(second.state().status, observed.status);
    assert_eq!(second.state().progress, observed.progress);

    h.runner.release();
    wait_finished(&h.manager, "video-1").await;
    assert_eq!(h.runner.spawns(), 1);
}

#[tokio::test]
async fn test_progress_never_moves_backwards() {
    let h = harness(Finish::Succeed).await;
    h.manager.start("video-1").await.unwrap();
    wait_progress(&h.manager, "video-1", 50.0).await;

    // 10.0 arrived after 25.0 and must not have been stored
    let state = h.store.get("video-1").await;
    assert_eq!(state.status, JobStatus::Downloading);
    assert_eq!(state.progress, 50.0);

    h.runner.release();
    wait_finished(&h.manager, "video-1").await;
}

#[tokio::test]
async fn test_success_is_ready_at_100() {
    let h = harness(Finish::Succeed).await;
    h.manager.start("video-1").await.unwrap();
    wait_progress(&h.manager, "video-1", 50.0).await;
    h.runner.release();
    wait_finished(&h.manager, "video-1").await;

    let state = h.manager.status("video-1").await;
    assert_eq!(state.status, JobStatus::Ready);
    assert_eq!(state.progress, 100.0);

    let file = h.manager.ready_file("video-1").await.unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"complete mp4");
    assert!(!h.manager.paths().scratch_dir("video-1").exists());

    // A finished job is not downloaded again
    let again = h.manager.start("video-1").await.unwrap();
    assert!(matches!(again, StartOutcome::AlreadyReady(_)));
    assert_eq!(h.runner.spawns(), 1);
}

#[tokio::test]
async fn test_ready_download_records_media_info() {
    let inspector = StubInspector {
        info: Some(MediaInfo {
            duration_secs: Some(61.5),
            size_bytes: 12,
            width: Some(1920),
            height: Some(1080),
        }),
    };
    let h = harness_with(Finish::Succeed, Some(inspector)).await;
    h.manager.start("video-1").await.unwrap();
    wait_progress(&h.manager, "video-1", 50.0).await;
    h.runner.release();
    wait_finished(&h.manager, "video-1").await;

    let video = h.catalog.get("video-1").await.unwrap();
    assert_eq!(video.duration_secs, Some(61.5));
    assert_eq!(video.file_size, Some(12));
    assert_eq!(video.resolution.as_deref(), Some("1920x1080"));
}

#[tokio::test]
async fn test_unreadable_media_info_keeps_download_ready() {
    let h = harness_with(Finish::Succeed, Some(StubInspector { info: None })).await;
    h.manager.start("video-1").await.unwrap();
    wait_progress(&h.manager, "video-1", 50.0).await;
    h.runner.release();
    wait_finished(&h.manager, "video-1").await;

    assert_eq!(h.manager.status("video-1").await.status, JobStatus::Ready);
    let video = h.catalog.get("video-1").await.unwrap();
    assert_eq!(video.duration_secs, Some(60.0));
    assert_eq!(video.resolution, None);
}

#[tokio::test]
async fn test_cancel_discards_partial_file() {
    let h = harness(Finish::Succeed).await;
    h.manager.start("video-1").await.unwrap();
    wait_progress(&h.manager, "video-1", 50.0).await;

    let output = h.manager.paths().output_path("video-1");
    assert!(output.exists());

    let state = h.manager.cancel("video-1").await.unwrap();
    assert_eq!(state.status, JobStatus::Idle);
    assert!(!output.exists());
    assert!(!h.manager.is_active("video-1"));
    assert_eq!(h.manager.status("video-1").await.status, JobStatus::Idle);

    // Idempotent
    h.manager.cancel("video-1").await.unwrap();
}

#[tokio::test]
async fn test_failure_records_error_and_removes_file() {
    let h = harness(Finish::Fail).await;
    h.manager.start("video-1").await.unwrap();
    wait_progress(&h.manager, "video-1", 50.0).await;
    h.runner.release();
    wait_finished(&h.manager, "video-1").await;

    let state = h.manager.status("video-1").await;
    assert_eq!(state.status, JobStatus::Error);
    assert!(state.error.unwrap().contains("exited with status 1"));
    assert!(!h.manager.paths().output_path("video-1").exists());
}

#[tokio::test]
async fn test_restart_replaces_running_job() {
    let h = harness(Finish::Succeed).await;
    h.manager.start("video-1").await.unwrap();
    wait_progress(&h.manager, "video-1", 50.0).await;

    let restarted = h.manager.restart("video-1").await.unwrap();
    assert!(restarted.is_fresh_start());
    assert_eq!(restarted.state().progress, 0.0);
    wait_progress(&h.manager, "video-1", 50.0).await;
    assert_eq!(h.runner.spawns(), 2);

    h.runner.release();
    wait_finished(&h.manager, "video-1").await;
    assert_eq!(h.manager.status("video-1").await.status, JobStatus::Ready);
}

#[tokio::test]
async fn test_ready_with_missing_file_reads_idle() {
    let h = harness(Finish::Succeed).await;
    h.store.put("video-1", JobState::ready()).await.unwrap();
    assert_eq!(h.manager.status("video-1").await.status, JobStatus::Idle);
    assert!(h.manager.ready_file("video-1").await.is_none());
}

#[tokio::test]
async fn test_purge_forgets_finished_job() {
    let h = harness(Finish::Succeed).await;
    h.manager.start("video-1").await.unwrap();
    wait_progress(&h.manager, "video-1", 50.0).await;
    h.runner.release();
    wait_finished(&h.manager, "video-1").await;

    h.manager.purge("video-1").await.unwrap();
    assert!(!h.manager.paths().output_path("video-1").exists());
    assert!(h.store.keys().await.is_empty());
}
