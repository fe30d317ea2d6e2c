//! Playlist parsing modules
//!
//! Contains the HLS playlist parser used by the manifest fetcher and the
//! `hls-probe` tool.

pub mod m3u8_parser;

// Re-export commonly used parsers
pub use m3u8_parser::*;
