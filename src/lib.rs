//! HLS Vault - Core Library
//!
//! Turns signed HLS stream URLs into local MP4 files through background
//! download jobs, and exposes the job-control and catalog API over HTTP.

pub mod commands;
pub mod core;
pub mod parsers;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{
    catalog::{LocalCatalog, VideoCatalog},
    config::AppConfig,
    encoder::Encoder,
    job_store::{FileJobStore, JobStore, MemoryJobStore},
    manager::{DownloadManager, JobPaths, StartOutcome},
    models::{AppError, AppResult, JobState, JobStatus, Video},
    quota::QuotaLedger,
    runner::{EncoderRunner, JobRunner, SegmentRunner},
};

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use crate::core::config::{DownloadStrategy, JobStoreKind};
use crate::core::manifest::ManifestFetcher;
use crate::core::muxer::Muxer;
use crate::core::segment_fetcher::SegmentFetcher;
use crate::utils::file_utils::{ensure_dir_exists, remove_dir_if_exists};

/// Application state shared between HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub manager: Arc<DownloadManager>,
    pub catalog: Arc<dyn VideoCatalog>,
    pub quota: Arc<QuotaLedger>,
    pub encoder: Encoder,
}

impl AppState {
    /// Wire stores, runner and manager from configuration
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let storage = &config.storage;

        if config.advanced.cleanup_temp_on_start {
            remove_dir_if_exists(&storage.temp_dir)
                .await
                .with_context(|| format!("Failed to clean temp dir {:?}", storage.temp_dir))?;
        }
        ensure_dir_exists(&storage.library_dir)?;
        ensure_dir_exists(&storage.temp_dir)?;
        ensure_dir_exists(&storage.state_dir)?;

        let store: Arc<dyn JobStore> = match storage.job_store {
            JobStoreKind::Memory => Arc::new(MemoryJobStore::new()),
            JobStoreKind::File => Arc::new(FileJobStore::open(storage.jobs_file()).await?),
        };

        let catalog: Arc<dyn VideoCatalog> = if storage.persist_catalog {
            Arc::new(LocalCatalog::open(config.catalog.clone(), storage.catalog_file()).await?)
        } else {
            Arc::new(LocalCatalog::new(config.catalog.clone()))
        };

        let quota = Arc::new(if storage.persist_catalog {
            QuotaLedger::open(config.quota.clone(), storage.quota_file()).await?
        } else {
            QuotaLedger::new(config.quota.clone())
        });

        let encoder = Encoder::new(config.encoder.clone());
        let runner = Self::build_runner(&config, &encoder)?;
        let paths = JobPaths {
            library_dir: storage.library_dir.clone(),
            temp_dir: storage.temp_dir.clone(),
        };
        let mut manager = DownloadManager::new(store, runner, catalog.clone(), paths);
        if config.encoder.inspect_output {
            manager = manager.with_inspector(Arc::new(encoder.clone()));
        }
        let manager = Arc::new(manager);

        info!(
            "{} v{} ready (library {:?}, {:?} job store)",
            NAME, VERSION, storage.library_dir, storage.job_store
        );

        Ok(Self {
            config: Arc::new(config),
            manager,
            catalog,
            quota,
            encoder,
        })
    }

    fn build_runner(config: &AppConfig, encoder: &Encoder) -> anyhow::Result<Arc<dyn JobRunner>> {
        let runner: Arc<dyn JobRunner> = match config.download.strategy {
            DownloadStrategy::Encoder => Arc::new(EncoderRunner::new(encoder.clone())),
            DownloadStrategy::Segments => {
                let client = config.download.http_client()?;
                let retry = config.download.retry_policy();
                Arc::new(SegmentRunner::new(
                    ManifestFetcher::new(client.clone(), retry.clone()),
                    SegmentFetcher::new(client, retry, config.download.max_concurrent_segments),
                    Muxer::new(encoder.clone(), config.encoder.remux_transport_streams),
                ))
            }
        };
        Ok(runner)
    }
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
