//! Progress sources for download jobs
//!
//! Two producers feed a job's progress value: the encoder's diagnostic
//! stream (`Duration:` and `time=` lines on stderr) and the segment fetcher
//! (completed segments over total). Both report into a [`ProgressRange`] so
//! that multi-stage pipelines map each stage onto its own slice of 0..100.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::error;

use crate::core::models::MAX_RUNNING_PROGRESS;

/// Callback receiving overall progress in percent
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// A progress callback that drops every update
pub fn noop_progress() -> ProgressCallback {
    Arc::new(|_| {})
}

/// Slice of the overall 0..100 range owned by one pipeline stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRange {
    pub start: f64,
    pub end: f64,
}

impl Default for ProgressRange {
    fn default() -> Self {
        Self::FULL
    }
}

impl ProgressRange {
    pub const FULL: ProgressRange = ProgressRange {
        start: 0.0,
        end: 100.0,
    };

    pub fn new(start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 100.0);
        Self {
            start,
            end: end.clamp(start, 100.0),
        }
    }

    /// Map a stage-local fraction in `[0, 1]` onto this range
    pub fn map(&self, fraction: f64) -> f64 {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.start + fraction * (self.end - self.start)
    }

    /// `completed` out of `total` items, mapped onto this range
    pub fn map_count(&self, completed: usize, total: usize) -> f64 {
        if total == 0 {
            return self.end;
        }
        self.map(completed as f64 / total as f64)
    }
}

/// Parse an encoder timestamp such as `00:01:02.50` into seconds
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Incremental parser for the encoder's stderr.
///
/// The total comes from the first `Duration:` line; when the encoder never
/// reports one (live-ish playlists answer `N/A`), the caller-supplied
/// fallback duration is used instead.
#[derive(Debug, Clone, Default)]
pub struct EncoderProgressParser {
    total_secs: Option<f64>,
    fallback_secs: Option<f64>,
    position_secs: f64,
}

impl EncoderProgressParser {
    pub fn new(fallback_secs: Option<f64>) -> Self {
        Self {
            total_secs: None,
            fallback_secs: fallback_secs.filter(|d| *d > 0.0),
            position_secs: 0.0,
        }
    }

    pub fn total_secs(&self) -> Option<f64> {
        self.total_secs.or(self.fallback_secs)
    }

    pub fn position_secs(&self) -> f64 {
        self.position_secs
    }

    /// Feed one line; returns the new percentage when the line moved progress
    pub fn feed_line(&mut self, line: &str) -> Option<f64> {
        if self.total_secs.is_none() {
            if let Some(value) = capture(duration_pattern(), line) {
                if let Some(total) = parse_timestamp(value).filter(|t| *t > 0.0) {
                    self.total_secs = Some(total);
                }
                return None;
            }
        }

        let position = parse_timestamp(capture(time_pattern(), line)?)?;
        self.position_secs = position;
        let total = self.total_secs()?;
        Some((position / total * 100.0).clamp(0.0, MAX_RUNNING_PROGRESS))
    }
}

const DURATION_SOURCE: &str = r"Duration:\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)";
const TIME_SOURCE: &str = r"time=\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)";

static DURATION_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
static TIME_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

/// Compile a built-in pattern; a bad one panics in debug builds and is
/// logged in release, where progress then stays unparsed.
fn compile_pattern(source: &str) -> Option<Regex> {
    match Regex::new(source) {
        Ok(re) => Some(re),
        Err(e) => {
            error!("Invalid progress pattern {:?}: {}", source, e);
            debug_assert!(false, "invalid progress pattern {source:?}: {e}");
            None
        }
    }
}

fn duration_pattern() -> Option<&'static Regex> {
    DURATION_PATTERN
        .get_or_init(|| compile_pattern(DURATION_SOURCE))
        .as_ref()
}

fn time_pattern() -> Option<&'static Regex> {
    TIME_PATTERN.get_or_init(|| compile_pattern(TIME_SOURCE)).as_ref()
}

/// First capture group of `pattern` in `line`
fn capture<'a>(pattern: Option<&Regex>, line: &'a str) -> Option<&'a str> {
    pattern?.captures(line)?.get(1).map(|m| m.as_str())
}

/// Read `reader` to EOF, calling `on_line` for every non-empty line.
///
/// Lines end at `\r` as well as `\n`: the encoder rewrites its status line
/// in place with carriage returns.
pub async fn scan_lines<R, F>(mut reader: R, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::with_capacity(256);

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            if byte == b'\r' || byte == b'\n' {
                emit_line(&mut pending, &mut on_line);
            } else {
                pending.push(byte);
            }
        }
    }

    emit_line(&mut pending, &mut on_line);
    Ok(())
}

fn emit_line<F: FnMut(&str)>(pending: &mut Vec<u8>, on_line: &mut F) {
    if pending.is_empty() {
        return;
    }
    let line = String::from_utf8_lossy(pending);
    let trimmed = line.trim();
    if !trimmed.is_empty() {
        on_line(trimmed);
    }
    pending.clear();
}

/// Last few lines of a diagnostic stream, kept for error messages
#[derive(Debug, Clone)]
pub struct LineTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}
