//! M3U8 playlist parsing utilities
//!
//! Playlists are parsed with `m3u8-rs`; this module narrows the result to
//! what the download pipeline needs: media segment references with their
//! byte ranges, `EXT-X-MAP` initialization segments, `EXT-X-MEDIA` audio
//! renditions and `EXT-X-STREAM-INF` variants, all resolved against the
//! playlist URL.

use m3u8_rs::{AlternativeMediaType, KeyMethod, MasterPlaylist, MediaPlaylist, Playlist};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

use crate::core::error_handling::PipelineError;

/// Extensions that mark a URI line as a media segment reference.
pub const SEGMENT_EXTENSIONS: &[&str] = &[
    "ts", "m4s", "mp4", "m4v", "m4a", "aac", "cmfv", "cmfa", "mp3", "vtt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaylistKind {
    Master,
    Media,
}

/// Container family of a media playlist's segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentFormat {
    /// MPEG-TS chunks, byte-concatenable
    TransportStream,
    /// fMP4/CMAF fragments that need their init segment and a real muxer
    FragmentedMp4,
    /// Raw ADTS/MP3 audio chunks
    PackedAudio,
}

impl SegmentFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::TransportStream => "ts",
            Self::FragmentedMp4 => "m4s",
            Self::PackedAudio => "aac",
        }
    }
}

/// Absolute byte range inside a segment resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// `Range` header value, e.g. `bytes=1000-1999`
    pub fn header_value(&self) -> String {
        format!(
            "bytes={}-{}",
            self.offset,
            self.offset + self.length.saturating_sub(1)
        )
    }
}

/// One resource to download: a URL, optionally narrowed to a byte range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRequest {
    pub url: String,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct M3u8Segment {
    pub url: String,
    pub duration: Option<f64>,
    pub sequence: u64,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct M3u8Variant {
    pub url: String,
    pub bandwidth: u64,
    pub resolution: Option<String>,
    pub audio_group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct M3u8Rendition {
    pub group_id: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct M3u8Playlist {
    pub url: String,
    pub kind: PlaylistKind,
    pub segments: Vec<M3u8Segment>,
    pub init_segment: Option<SegmentRequest>,
    pub variants: Vec<M3u8Variant>,
    pub audio_renditions: Vec<M3u8Rendition>,
    pub ended: bool,
    pub target_duration: Option<f64>,
}

impl M3u8Playlist {
    fn empty(url: &str, kind: PlaylistKind) -> Self {
        Self {
            url: url.to_string(),
            kind,
            segments: Vec::new(),
            init_segment: None,
            variants: Vec::new(),
            audio_renditions: Vec::new(),
            ended: false,
            target_duration: None,
        }
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().filter_map(|s| s.duration).sum()
    }

    /// Highest-bandwidth variant of a master playlist
    pub fn best_variant(&self) -> Option<&M3u8Variant> {
        self.variants.iter().max_by_key(|v| v.bandwidth)
    }

    /// Audio rendition with a fetchable URI for the given variant's group.
    ///
    /// Prefers the `DEFAULT=YES` entry of the group.
    pub fn audio_rendition_for(&self, variant: &M3u8Variant) -> Option<&M3u8Rendition> {
        let group = variant.audio_group.as_deref()?;
        let mut candidates = self
            .audio_renditions
            .iter()
            .filter(|r| r.group_id == group && r.url.is_some());
        let first = candidates.next()?;
        Some(
            std::iter::once(first)
                .chain(candidates)
                .find(|r| r.is_default)
                .unwrap_or(first),
        )
    }

    pub fn segment_format(&self) -> SegmentFormat {
        if self.init_segment.is_some() {
            return SegmentFormat::FragmentedMp4;
        }
        let ext = self
            .segments
            .first()
            .and_then(|s| reference_extension(&s.url))
            .unwrap_or_default();
        match ext.as_str() {
            "m4s" | "mp4" | "m4v" | "m4a" | "cmfv" | "cmfa" => SegmentFormat::FragmentedMp4,
            "aac" | "mp3" => SegmentFormat::PackedAudio,
            _ => SegmentFormat::TransportStream,
        }
    }

    /// Segment requests in download order, init segment first when present
    pub fn fetch_list(&self) -> Vec<SegmentRequest> {
        self.init_segment
            .iter()
            .cloned()
            .chain(self.segments.iter().map(|s| SegmentRequest {
                url: s.url.clone(),
                byte_range: s.byte_range,
            }))
            .collect()
    }
}

/// Parse M3U8 playlist content fetched from `playlist_url`.
///
/// Media playlists without a single resolvable segment, master playlists
/// without variants and encrypted playlists are rejected.
pub fn parse_m3u8_content(content: &str, playlist_url: &str) -> Result<M3u8Playlist, PipelineError> {
    let base = Url::parse(playlist_url)
        .map_err(|e| PipelineError::ManifestParse(format!("invalid playlist URL {playlist_url}: {e}")))?;

    if !content.trim_start().starts_with("#EXTM3U") {
        return Err(PipelineError::ManifestParse("missing #EXTM3U header".into()));
    }

    // The last URI line needs its terminator
    let mut content = content.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    let parsed = m3u8_rs::parse_playlist_res(content.as_bytes())
        .map_err(|e| PipelineError::ManifestParse(format!("malformed playlist: {:?}", e)))?;

    match parsed {
        Playlist::MasterPlaylist(master) => from_master(&master, &base, playlist_url),
        Playlist::MediaPlaylist(media) => from_media(&media, &base, playlist_url),
    }
}

fn from_master(
    master: &MasterPlaylist,
    base: &Url,
    playlist_url: &str,
) -> Result<M3u8Playlist, PipelineError> {
    let mut playlist = M3u8Playlist::empty(playlist_url, PlaylistKind::Master);

    for variant in master.variants.iter().filter(|v| !v.is_i_frame) {
        playlist.variants.push(M3u8Variant {
            url: resolve_reference(base, &variant.uri)?,
            bandwidth: variant.bandwidth,
            resolution: variant
                .resolution
                .as_ref()
                .map(|r| format!("{}x{}", r.width, r.height)),
            audio_group: variant.audio.clone(),
        });
    }

    for media in &master.alternatives {
        if media.media_type != AlternativeMediaType::Audio {
            continue;
        }
        let url = match &media.uri {
            Some(uri) => Some(resolve_reference(base, uri)?),
            None => None,
        };
        playlist.audio_renditions.push(M3u8Rendition {
            group_id: media.group_id.clone(),
            name: Some(media.name.clone()).filter(|n| !n.is_empty()),
            url,
            is_default: media.default,
        });
    }

    if playlist.variants.is_empty() {
        return Err(PipelineError::ManifestParse(
            "master playlist lists no variant streams".into(),
        ));
    }
    Ok(playlist)
}

fn from_media(
    media: &MediaPlaylist,
    base: &Url,
    playlist_url: &str,
) -> Result<M3u8Playlist, PipelineError> {
    let mut playlist = M3u8Playlist::empty(playlist_url, PlaylistKind::Media);
    playlist.ended = media.end_list;
    playlist.target_duration = Some(media.target_duration as f64).filter(|d| *d > 0.0);

    // Byte ranges without an offset continue where the previous range of
    // the same resource ended
    let mut range_ends: HashMap<String, u64> = HashMap::new();
    let mut sequence = media.media_sequence;

    for segment in &media.segments {
        if let Some(key) = &segment.key {
            if key.method != KeyMethod::None {
                return Err(PipelineError::Unsupported(format!(
                    "encrypted playlists ({:?}) are not supported",
                    key.method
                )));
            }
        }

        if playlist.init_segment.is_none() {
            if let Some(map) = &segment.map {
                let url = resolve_reference(base, &map.uri)?;
                let byte_range = map
                    .byte_range
                    .as_ref()
                    .map(|r| absolute_range(&mut range_ends, &url, r.length, r.offset));
                playlist.init_segment = Some(SegmentRequest { url, byte_range });
            }
        }

        if !is_segment_reference(&segment.uri) {
            debug!("Ignoring non-media playlist entry: {}", segment.uri);
            continue;
        }

        let url = resolve_reference(base, &segment.uri)?;
        let byte_range = segment
            .byte_range
            .as_ref()
            .map(|r| absolute_range(&mut range_ends, &url, r.length, r.offset));
        playlist.segments.push(M3u8Segment {
            url,
            duration: Some(segment.duration as f64).filter(|d| *d > 0.0),
            sequence,
            byte_range,
        });
        sequence += 1;
    }

    if playlist.segments.is_empty() {
        return Err(PipelineError::ManifestParse(
            "playlist contains no resolvable media segments".into(),
        ));
    }
    Ok(playlist)
}

fn absolute_range(
    range_ends: &mut HashMap<String, u64>,
    url: &str,
    length: u64,
    offset: Option<u64>,
) -> ByteRange {
    let offset = offset.unwrap_or_else(|| range_ends.get(url).copied().unwrap_or(0));
    range_ends.insert(url.to_string(), offset + length);
    ByteRange { offset, length }
}

/// Lowercased extension of a URI reference, ignoring query and fragment
pub fn reference_extension(reference: &str) -> Option<String> {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

fn is_segment_reference(line: &str) -> bool {
    reference_extension(line)
        .map(|ext| SEGMENT_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn resolve_reference(base: &Url, reference: &str) -> Result<String, PipelineError> {
    base.join(reference.trim())
        .map(|u| u.to_string())
        .map_err(|e| PipelineError::ManifestParse(format!("failed to resolve {reference}: {e}")))
}
