//! HLS manifest fetching and variant resolution

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::error_handling::{PipelineError, RetryPolicy};
use crate::parsers::m3u8_parser::{parse_m3u8_content, M3u8Playlist, M3u8Variant, PlaylistKind};
use crate::utils::validation::redact_query;

/// Media playlists a download needs: the chosen video rendition and, when
/// the master playlist carries audio separately, its audio rendition.
#[derive(Debug, Clone)]
pub struct MediaSource {
    pub video: M3u8Playlist,
    pub audio: Option<M3u8Playlist>,
    /// Variant picked from the master playlist, if there was one
    pub variant: Option<M3u8Variant>,
}

impl MediaSource {
    pub fn total_duration(&self) -> f64 {
        self.video.total_duration()
    }

    pub fn segment_count(&self) -> usize {
        self.video.segments.len() + self.audio.as_ref().map_or(0, |a| a.segments.len())
    }
}

#[derive(Debug, Clone)]
pub struct ManifestFetcher {
    client: Client,
    retry: RetryPolicy,
}

impl ManifestFetcher {
    pub fn new(client: Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Fetch and parse one playlist
    pub async fn fetch_playlist(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<M3u8Playlist, PipelineError> {
        let content = self.fetch_text(url, token).await?;
        let playlist = parse_m3u8_content(&content, url)?;
        debug!(
            "Parsed {:?} playlist {}: {} segments, {} variants",
            playlist.kind,
            redact_query(url),
            playlist.segments.len(),
            playlist.variants.len()
        );
        Ok(playlist)
    }

    /// Fetch `url` and follow a master playlist down to its media playlists
    pub async fn resolve(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<MediaSource, PipelineError> {
        let playlist = self.fetch_playlist(url, token).await?;
        if playlist.kind == PlaylistKind::Media {
            return Ok(MediaSource {
                video: playlist,
                audio: None,
                variant: None,
            });
        }

        let variant = playlist
            .best_variant()
            .cloned()
            .ok_or_else(|| PipelineError::ManifestParse("master playlist lists no variant streams".into()))?;
        info!(
            "Selected variant {} ({} bps, {})",
            redact_query(&variant.url),
            variant.bandwidth,
            variant.resolution.as_deref().unwrap_or("unknown resolution")
        );

        let video = self.fetch_playlist(&variant.url, token).await?;
        if video.kind == PlaylistKind::Master {
            return Err(PipelineError::ManifestParse(
                "variant resolves to another master playlist".into(),
            ));
        }

        let audio_url = playlist
            .audio_rendition_for(&variant)
            .and_then(|rendition| rendition.url.clone());
        let audio = match audio_url {
            Some(audio_url) => {
                debug!("Fetching separate audio rendition {}", redact_query(&audio_url));
                Some(self.fetch_playlist(&audio_url, token).await?)
            }
            None => None,
        };

        Ok(MediaSource {
            video,
            audio,
            variant: Some(variant),
        })
    }

    async fn fetch_text(&self, url: &str, token: &CancellationToken) -> Result<String, PipelineError> {
        self.retry
            .run(token, |attempt| {
                let client = self.client.clone();
                let url = url.to_string();
                async move {
                    debug!("Fetching playlist {} (attempt {})", redact_query(&url), attempt);
                    let response = client
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| PipelineError::manifest_transport(&url, &e))?;

                    let status = response.status();
                    if !status.is_success() {
                        return Err(PipelineError::ManifestFetch {
                            url,
                            status: Some(status.as_u16()),
                            reason: status
                                .canonical_reason()
                                .unwrap_or("request failed")
                                .to_string(),
                        });
                    }

                    let body = response
                        .text()
                        .await
                        .map_err(|e| PipelineError::manifest_transport(&url, &e))?;
                    if body.trim().is_empty() {
                        return Err(PipelineError::ManifestFetch {
                            url,
                            status: Some(status.as_u16()),
                            reason: "empty playlist body".to_string(),
                        });
                    }
                    Ok(body)
                }
            })
            .await
    }
}
