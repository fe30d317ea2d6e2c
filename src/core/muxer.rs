//! Turning downloaded segments into a single MP4
//!
//! MPEG-TS chunks can be byte-concatenated; fragmented MP4 cannot be
//! concatenated into a valid final file, so its fragments are only joined
//! with their init segment as an intermediate and then remuxed by the
//! encoder.

use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::encoder::{Encoder, RemuxInputs};
use crate::core::error_handling::PipelineError;
use crate::parsers::m3u8_parser::SegmentFormat;
use crate::utils::file_utils::is_non_empty_file;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Downloaded files of one rendition, in playlist order
#[derive(Debug, Clone)]
pub struct SegmentSet {
    pub files: Vec<PathBuf>,
    pub format: SegmentFormat,
}

impl SegmentSet {
    fn needs_adts_filter(&self) -> bool {
        matches!(
            self.format,
            SegmentFormat::TransportStream | SegmentFormat::PackedAudio
        )
    }

    fn intermediate_name(&self, stem: &str) -> String {
        let ext = match self.format {
            SegmentFormat::TransportStream => "ts",
            SegmentFormat::FragmentedMp4 => "mp4",
            SegmentFormat::PackedAudio => "aac",
        };
        format!("{}.{}", stem, ext)
    }
}

/// Byte-concatenate `files` into `output`; returns the bytes written
pub async fn concat_segments(files: &[PathBuf], output: &Path) -> Result<u64, PipelineError> {
    if files.is_empty() {
        return Err(PipelineError::Mux("no segments to concatenate".to_string()));
    }
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    debug!("Concatenating {} segments into {:?}", files.len(), output);
    let mut out = File::create(output).await?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    for file in files {
        let mut input = File::open(file)
            .await
            .map_err(|e| PipelineError::Io(format!("segment file {:?}: {}", file, e)))?;
        loop {
            let n = input.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n]).await?;
            total += n as u64;
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok(total)
}

#[derive(Debug, Clone)]
pub struct Muxer {
    encoder: Encoder,
    remux_transport_streams: bool,
}

impl Muxer {
    pub fn new(encoder: Encoder, remux_transport_streams: bool) -> Self {
        Self {
            encoder,
            remux_transport_streams,
        }
    }

    /// Concatenate a rendition straight into the final file.
    ///
    /// Only transport streams and packed audio qualify.
    pub async fn concat_final(&self, set: &SegmentSet, output: &Path) -> Result<u64, PipelineError> {
        if set.format == SegmentFormat::FragmentedMp4 {
            return Err(PipelineError::Unsupported(
                "fragmented MP4 segments cannot be concatenated into a final file".to_string(),
            ));
        }
        concat_segments(&set.files, output).await
    }

    /// Stream-copy `video` (and optional separate `audio`) into an MP4 at `output`
    pub async fn remux(
        &self,
        video: &Path,
        audio: Option<&Path>,
        adts_audio: bool,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if audio.is_none() {
            info!("Remuxing {:?} without a separate audio track", video);
        }
        let command = self.encoder.remux(
            RemuxInputs {
                video,
                audio,
                adts_audio,
            },
            output,
        );
        self.encoder.run(&command, token, |_| {}).await?;

        if !is_non_empty_file(output).await {
            return Err(PipelineError::Mux(format!(
                "encoder produced no output at {:?}",
                output
            )));
        }
        Ok(())
    }

    /// Produce the final MP4 at `output` from downloaded renditions.
    ///
    /// Intermediate files are written under `scratch`.
    pub async fn finalize(
        &self,
        video: &SegmentSet,
        audio: Option<&SegmentSet>,
        scratch: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let direct_concat = audio.is_none()
            && video.format != SegmentFormat::FragmentedMp4
            && !self.remux_transport_streams;
        if direct_concat {
            info!("Concatenating transport stream segments directly into {:?}", output);
            self.concat_final(video, output).await?;
            return Ok(());
        }

        let video_file = scratch.join(video.intermediate_name("video"));
        concat_segments(&video.files, &video_file).await?;

        let audio_file = match audio {
            Some(set) => {
                let path = scratch.join(set.intermediate_name("audio"));
                concat_segments(&set.files, &path).await?;
                Some(path)
            }
            None => {
                if video.format == SegmentFormat::FragmentedMp4 {
                    warn!("No separate audio rendition; output will carry only what the video fragments contain");
                }
                None
            }
        };

        let adts_audio = audio.map_or(video.needs_adts_filter(), |a| a.needs_adts_filter());
        self.remux(&video_file, audio_file.as_deref(), adts_audio, output, token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EncoderConfig;
    use tempfile::tempdir;

    fn write_segments(dir: &Path, prefix: &str, parts: &[&[u8]]) -> Vec<PathBuf> {
        parts
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                let path = dir.join(format!("{}_{:06}.bin", prefix, i));
                std::fs::write(&path, bytes).unwrap();
                path
            })
            .collect()
    }

    fn muxer_with(config: EncoderConfig, remux_ts: bool) -> Muxer {
        Muxer::new(Encoder::new(config), remux_ts)
    }

    #[tokio::test]
    async fn test_concat_preserves_order() {
        let dir = tempdir().unwrap();
        let files = write_segments(dir.path(), "seg", &[b"aa", b"bbb", b"c"]);
        let out = dir.path().join("out").join("all.ts");

        let written = concat_segments(&files, &out).await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(std::fs::read(&out).unwrap(), b"aabbbc");
    }

    #[tokio::test]
    async fn test_concat_final_refuses_fragmented_mp4() {
        let dir = tempdir().unwrap();
        let set = SegmentSet {
            files: write_segments(dir.path(), "seg", &[b"init", b"frag"]),
            format: SegmentFormat::FragmentedMp4,
        };
        let muxer = muxer_with(EncoderConfig::default(), true);
        let err = muxer
            .concat_final(&set, &dir.path().join("out.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_transport_stream_without_remux_is_concatenated() {
        let dir = tempdir().unwrap();
        let set = SegmentSet {
            files: write_segments(dir.path(), "seg", &[b"G1", b"G2"]),
            format: SegmentFormat::TransportStream,
        };
        // Encoder must not be needed on this path
        let config = EncoderConfig {
            program: "definitely-not-an-encoder-binary".to_string(),
            ..EncoderConfig::default()
        };
        let out = dir.path().join("final.mp4");
        muxer_with(config, false)
            .finalize(&set, None, dir.path(), &out, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"G1G2");
    }

    #[cfg(unix)]
    fn stub_config(script: &str) -> EncoderConfig {
        EncoderConfig {
            program: "sh".to_string(),
            extra_args: vec!["-c".to_string(), script.to_string(), "stub-encoder".to_string()],
            ..EncoderConfig::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fragmented_mp4_with_audio_is_remuxed() {
        let dir = tempdir().unwrap();
        let video = SegmentSet {
            files: write_segments(dir.path(), "seg", &[b"init", b"frag1"]),
            format: SegmentFormat::FragmentedMp4,
        };
        let audio = SegmentSet {
            files: write_segments(dir.path(), "aud", &[b"ainit", b"afrag1"]),
            format: SegmentFormat::FragmentedMp4,
        };
        // The stub writes its own argument list into the output file
        let muxer = muxer_with(stub_config(r#"for last; do :; done; echo "$@" > "$last""#), true);
        let out = dir.path().join("final.mp4");
        muxer
            .finalize(&video, Some(&audio), dir.path(), &out, &CancellationToken::new())
            .await
            .unwrap();

        let args = std::fs::read_to_string(&out).unwrap();
        assert!(args.contains("video.mp4"));
        assert!(args.contains("audio.mp4"));
        assert!(args.contains("-map 0:v:0 -map 1:a:0"));
        assert!(args.contains("-movflags +faststart"));
        assert!(!args.contains("aac_adtstoasc"));
        assert_eq!(
            std::fs::read(dir.path().join("video.mp4")).unwrap(),
            b"initfrag1"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_output_is_mux_error() {
        let dir = tempdir().unwrap();
        let video = SegmentSet {
            files: write_segments(dir.path(), "seg", &[b"G1"]),
            format: SegmentFormat::TransportStream,
        };
        let muxer = muxer_with(stub_config("exit 0"), true);
        let err = muxer
            .finalize(
                &video,
                None,
                dir.path(),
                &dir.path().join("final.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Mux(_)));
    }
}
