//! Core business logic module
//!
//! The HLS download pipeline (manifest, segments, encoder, muxer), the
//! background job manager that drives it, and the catalog and quota
//! collaborators the HTTP layer calls into.

pub mod catalog;
pub mod config;
pub mod encoder;
pub mod error_handling;
pub mod job_store;
pub mod manager;
pub mod manifest;
pub mod models;
pub mod muxer;
pub mod progress;
pub mod quota;
pub mod runner;
pub mod segment_fetcher;

#[cfg(test)]
mod manager_test;


#[cfg(test)]
pub(crate) mod test_fixtures;

// Re-export commonly used types
pub use config::AppConfig;
pub use manager::DownloadManager;
