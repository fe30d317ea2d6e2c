//! External encoder (ffmpeg) command building and supervision

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::config::EncoderConfig;
use crate::core::error_handling::PipelineError;
use crate::core::models::MediaInfo;
use crate::core::progress::{scan_lines, LineTail};

const STDERR_TAIL_LINES: usize = 12;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Availability report for `GET /api/system/encoder`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderInfo {
    pub program: String,
    pub available: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

/// A fully built encoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Reads container facts from a finished file
#[async_trait]
pub trait MediaInspector: Send + Sync {
    async fn inspect(&self, path: &Path) -> Result<MediaInfo, PipelineError>;
}

/// Subset of the inspector JSON report (`-show_format -show_streams`)
#[derive(Debug, Deserialize)]
struct InspectOutput {
    #[serde(default)]
    format: Option<InspectFormat>,
    #[serde(default)]
    streams: Vec<InspectStream>,
}

#[derive(Debug, Deserialize)]
struct InspectFormat {
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InspectStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Parse an inspector JSON report; `file_size` stands in when the format
/// block has no size
pub fn parse_media_info(json: &[u8], file_size: u64) -> Result<MediaInfo, PipelineError> {
    let output: InspectOutput = serde_json::from_slice(json)
        .map_err(|e| PipelineError::Mux(format!("unreadable inspector output: {}", e)))?;

    let format = output.format.as_ref();
    let duration_secs = format
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0);
    let size_bytes = format
        .and_then(|f| f.size.as_deref())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(file_size);
    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    Ok(MediaInfo {
        duration_secs,
        size_bytes,
        width: video.and_then(|s| s.width),
        height: video.and_then(|s| s.height),
    })
}

/// Inputs of a stream-copy remux
#[derive(Debug, Clone, Copy)]
pub struct RemuxInputs<'a> {
    pub video: &'a Path,
    pub audio: Option<&'a Path>,
    /// Audio arrives as ADTS (MPEG-TS or packed AAC) and needs `aac_adtstoasc`
    pub adts_audio: bool,
}

#[derive(Debug, Clone)]
pub struct Encoder {
    config: EncoderConfig,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn program(&self) -> &str {
        &self.config.program
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        args.push("-y".to_string());
        args
    }

    fn codec_args(&self, args: &mut Vec<String>) {
        match (&self.config.video_codec, &self.config.audio_codec) {
            (None, None) => args.extend(["-c".to_string(), "copy".to_string()]),
            (video, audio) => {
                args.push("-c:v".to_string());
                args.push(video.clone().unwrap_or_else(|| "copy".to_string()));
                args.push("-c:a".to_string());
                args.push(audio.clone().unwrap_or_else(|| "copy".to_string()));
            }
        }
    }

    /// Command that reads an HLS playlist directly and writes an MP4
    pub fn hls_to_mp4(&self, input_url: &str, output: &Path) -> EncoderCommand {
        let mut args = self.base_args();
        args.extend(["-i".to_string(), input_url.to_string()]);
        self.codec_args(&mut args);
        args.extend(
            ["-bsf:a", "aac_adtstoasc", "-movflags", "+faststart"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(output.to_string_lossy().into_owned());

        EncoderCommand {
            program: self.config.program.clone(),
            args,
        }
    }

    /// Command that remuxes local media files into an MP4
    pub fn remux(&self, inputs: RemuxInputs<'_>, output: &Path) -> EncoderCommand {
        let mut args = self.base_args();
        args.extend(["-i".to_string(), inputs.video.to_string_lossy().into_owned()]);
        if let Some(audio) = inputs.audio {
            args.extend(
                [
                    "-i".to_string(),
                    audio.to_string_lossy().into_owned(),
                    "-map".to_string(),
                    "0:v:0".to_string(),
                    "-map".to_string(),
                    "1:a:0".to_string(),
                ],
            );
        }
        self.codec_args(&mut args);
        if inputs.adts_audio {
            args.extend(["-bsf:a".to_string(), "aac_adtstoasc".to_string()]);
        }
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        args.push(output.to_string_lossy().into_owned());

        EncoderCommand {
            program: self.config.program.clone(),
            args,
        }
    }

    /// Run `command` to completion, feeding every stderr line to `on_line`.
    ///
    /// The child is killed when `token` is cancelled or the configured
    /// maximum runtime elapses.
    pub async fn run<F>(
        &self,
        command: &EncoderCommand,
        token: &CancellationToken,
        mut on_line: F,
    ) -> Result<(), PipelineError>
    where
        F: FnMut(&str) + Send,
    {
        debug!("Spawning encoder {} with {} arguments", command.program, command.args.len());
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|e| PipelineError::Mux(format!("failed to start {}: {}", command.program, e)))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::Mux("encoder stderr was not captured".to_string()))?;

        let mut tail = LineTail::new(STDERR_TAIL_LINES);
        let max_runtime = self.config.max_runtime();

        let outcome = {
            let wait = async {
                scan_lines(stderr, |line| {
                    tail.push(line);
                    on_line(line);
                })
                .await?;
                child.wait().await
            };

            tokio::select! {
                status = wait => Ok(status),
                _ = token.cancelled() => Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(max_runtime) => Err(PipelineError::Mux(format!(
                    "encoder exceeded maximum runtime of {}s",
                    max_runtime.as_secs()
                ))),
            }
        };

        match outcome {
            Err(interrupt) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill encoder process: {}", e);
                }
                Err(interrupt)
            }
            Ok(Err(io)) => Err(PipelineError::Io(format!("encoder io error: {}", io))),
            Ok(Ok(status)) => check_exit(&command.program, status, &tail),
        }
    }

    /// Run `<program> -version` and report whether the encoder is usable
    pub async fn probe(&self) -> EncoderInfo {
        let program = self.config.program.clone();
        let output = timeout(
            PROBE_TIMEOUT,
            Command::new(&program)
                .arg("-version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match output {
            Ok(Ok(out)) if out.status.success() => EncoderInfo {
                version: String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .next()
                    .map(|l| l.trim().to_string()),
                program,
                available: true,
                error: None,
            },
            Ok(Ok(out)) => EncoderInfo {
                program,
                available: false,
                version: None,
                error: Some(format!("exited with {}", out.status)),
            },
            Ok(Err(e)) => EncoderInfo {
                program,
                available: false,
                version: None,
                error: Some(e.to_string()),
            },
            Err(_) => EncoderInfo {
                program,
                available: false,
                version: None,
                error: Some("timed out".to_string()),
            },
        }
    }
}

#[async_trait]
impl MediaInspector for Encoder {
    async fn inspect(&self, path: &Path) -> Result<MediaInfo, PipelineError> {
        self.inspect_media(path).await
    }
}

impl Encoder {
    /// Run the inspector on `path` and parse its JSON report
    pub async fn inspect_media(&self, path: &Path) -> Result<MediaInfo, PipelineError> {
        let file_size = tokio::fs::metadata(path).await?.len();
        let program = &self.config.inspect_program;
        let mut command = Command::new(program);
        command
            .args(&self.config.inspect_args)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = timeout(INSPECT_TIMEOUT, command.output())
            .await
            .map_err(|_| PipelineError::Mux(format!("{} timed out", program)))?
            .map_err(|e| PipelineError::Mux(format!("failed to start {}: {}", program, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Mux(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        let info = parse_media_info(&output.stdout, file_size)?;
        debug!("Inspected {:?}: {:?}", path, info);
        Ok(info)
    }
}

fn check_exit(program: &str, status: ExitStatus, tail: &LineTail) -> Result<(), PipelineError> {
    if status.success() {
        return Ok(());
    }
    let detail = if tail.is_empty() {
        String::new()
    } else {
        format!(": {}", tail.joined())
    };
    Err(PipelineError::Mux(format!("{} exited with {}{}", program, status, detail)))
}
