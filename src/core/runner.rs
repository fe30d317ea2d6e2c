//! Job runners: the strategies that turn a video into an MP4 file
//!
//! The manager owns job state; a runner only produces the output file,
//! reports progress and honours cancellation.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::encoder::Encoder;
use crate::core::error_handling::PipelineError;
use crate::core::manifest::{ManifestFetcher, MediaSource};
use crate::core::muxer::{Muxer, SegmentSet};
use crate::core::progress::{EncoderProgressParser, ProgressCallback, ProgressRange};
use crate::core::segment_fetcher::{SegmentBatch, SegmentFetcher};
use crate::utils::file_utils::is_non_empty_file;

/// Everything a runner needs for one attempt
#[derive(Debug, Clone)]
pub struct JobContext {
    pub key: String,
    pub stream_url: String,
    /// Duration known from the catalog, used when the encoder reports none
    pub duration_hint: Option<f64>,
    pub output_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub token: CancellationToken,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce `ctx.output_path`; progress values are in percent
    async fn run(&self, ctx: &JobContext, progress: ProgressCallback) -> Result<(), PipelineError>;
}

/// Lets the encoder read the playlist itself and scrapes its progress
#[derive(Debug, Clone)]
pub struct EncoderRunner {
    encoder: Encoder,
}

impl EncoderRunner {
    pub fn new(encoder: Encoder) -> Self {
        Self { encoder }
    }
}

#[async_trait]
impl JobRunner for EncoderRunner {
    fn name(&self) -> &'static str {
        "encoder"
    }

    async fn run(&self, ctx: &JobContext, progress: ProgressCallback) -> Result<(), PipelineError> {
        if let Some(parent) = ctx.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let command = self.encoder.hls_to_mp4(&ctx.stream_url, &ctx.output_path);
        let mut parser = EncoderProgressParser::new(ctx.duration_hint);

        self.encoder
            .run(&command, &ctx.token, |line| {
                if let Some(pct) = parser.feed_line(line) {
                    progress(pct);
                }
            })
            .await?;

        if !is_non_empty_file(&ctx.output_path).await {
            return Err(PipelineError::Mux(
                "encoder exited successfully but produced no output".to_string(),
            ));
        }
        info!(
            "Encoder finished {} ({:.1}s of media)",
            ctx.key,
            parser.position_secs()
        );
        Ok(())
    }
}

/// In-process manifest, segment and mux pipeline
#[derive(Debug, Clone)]
pub struct SegmentRunner {
    manifest: ManifestFetcher,
    fetcher: SegmentFetcher,
    muxer: Muxer,
}

const RESOLVE_DONE: f64 = 2.0;
const FETCH_DONE: f64 = 90.0;

impl SegmentRunner {
    pub fn new(manifest: ManifestFetcher, fetcher: SegmentFetcher, muxer: Muxer) -> Self {
        Self {
            manifest,
            fetcher,
            muxer,
        }
    }

    fn warn_about_source(key: &str, source: &MediaSource) {
        if !source.video.ended {
            warn!("Playlist for {} has no ENDLIST; downloading the current snapshot", key);
        }
        let expects_audio = source
            .variant
            .as_ref()
            .map_or(false, |v| v.audio_group.is_some());
        if expects_audio && source.audio.is_none() {
            warn!("Variant for {} names an audio group without a URI; output may lack separate audio", key);
        }
    }
}

#[async_trait]
impl JobRunner for SegmentRunner {
    fn name(&self) -> &'static str {
        "segments"
    }

    async fn run(&self, ctx: &JobContext, progress: ProgressCallback) -> Result<(), PipelineError> {
        let source = self.manifest.resolve(&ctx.stream_url, &ctx.token).await?;
        Self::warn_about_source(&ctx.key, &source);
        progress(RESOLVE_DONE);

        let video_total = source.video.fetch_list().len();
        let audio_total = source.audio.as_ref().map_or(0, |a| a.fetch_list().len());
        let split = RESOLVE_DONE
            + (FETCH_DONE - RESOLVE_DONE) * video_total as f64 / (video_total + audio_total) as f64;

        info!(
            "Fetching {} video and {} audio segments for {} ({:.0}s)",
            video_total,
            audio_total,
            ctx.key,
            source.total_duration()
        );

        let video_batch = SegmentBatch {
            requests: source.video.fetch_list(),
            out_dir: ctx.scratch_dir.clone(),
            prefix: "seg".to_string(),
            range: ProgressRange::new(RESOLVE_DONE, split),
        };
        let video = SegmentSet {
            files: self
                .fetcher
                .fetch_all(&video_batch, &ctx.token, progress.clone())
                .await?,
            format: source.video.segment_format(),
        };

        let audio = match &source.audio {
            Some(playlist) => {
                let batch = SegmentBatch {
                    requests: playlist.fetch_list(),
                    out_dir: ctx.scratch_dir.clone(),
                    prefix: "aud".to_string(),
                    range: ProgressRange::new(split, FETCH_DONE),
                };
                Some(SegmentSet {
                    files: self.fetcher.fetch_all(&batch, &ctx.token, progress.clone()).await?,
                    format: playlist.segment_format(),
                })
            }
            None => None,
        };

        if ctx.token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        progress(FETCH_DONE);

        self.muxer
            .finalize(
                &video,
                audio.as_ref(),
                &ctx.scratch_dir,
                &ctx.output_path,
                &ctx.token,
            )
            .await
    }
}
