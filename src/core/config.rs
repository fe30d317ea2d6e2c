//! Application configuration management
//!
//! Configuration is layered with the `config` crate: built-in defaults, then
//! the JSON file (path from `HLS_VAULT_CONFIG` or the platform config dir),
//! then environment variables such as `HLS_VAULT__DOWNLOAD__RETRY_ATTEMPTS=5`.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error_handling::RetryPolicy;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "HLS_VAULT";

/// Environment variable pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "HLS_VAULT_CONFIG";

/// Main application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub download: DownloadSettings,
    pub encoder: EncoderConfig,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub quota: QuotaConfig,
    pub advanced: AdvancedConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Shared secret for `/api/admin/*`; admin routes are disabled when unset
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8787".to_string(),
            admin_token: None,
        }
    }
}

/// Which runner turns a video into an MP4
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStrategy {
    /// The encoder reads the playlist itself
    #[default]
    Encoder,
    /// In-process manifest and segment fetching, then mux
    Segments,
}

/// Network and pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    pub strategy: DownloadStrategy,
    pub max_concurrent_segments: usize,
    /// Total attempts per HTTP fetch, including the first
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub user_agent: String,
    pub headers: HashMap<String, String>,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            strategy: DownloadStrategy::Encoder,
            max_concurrent_segments: 8,
            retry_attempts: 3,
            retry_base_delay_ms: 250,
            timeout_seconds: 30,
            connect_timeout_seconds: 10,
            user_agent: format!("hls-vault/{}", env!("CARGO_PKG_VERSION")),
            headers: HashMap::new(),
        }
    }
}

impl DownloadSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    /// Build the shared HTTP client for manifest and segment fetches
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &self.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name: {}", name))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .with_context(|| format!("Invalid header value for {}", name))?;
            headers.insert(name, value);
        }

        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .default_headers(headers)
            .timeout(Duration::from_secs(self.timeout_seconds))
            .connect_timeout(Duration::from_secs(self.connect_timeout_seconds))
            .build()
            .context("Failed to build HTTP client")
    }
}

/// External encoder (ffmpeg) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub program: String,
    /// Arguments placed before every generated command line
    pub extra_args: Vec<String>,
    /// Route concatenated MPEG-TS through a stream-copy remux into MP4
    pub remux_transport_streams: bool,
    /// Hard limit for one encoder run; the child is killed afterwards
    pub max_runtime_secs: u64,
    /// Re-encode with these codecs instead of stream copy
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// Read duration and resolution back from finished files
    pub inspect_output: bool,
    /// Media inspector (ffprobe) executable
    pub inspect_program: String,
    /// Arguments placed before every inspector command line
    pub inspect_args: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            extra_args: vec!["-hide_banner".to_string()],
            remux_transport_streams: true,
            max_runtime_secs: 6 * 60 * 60,
            video_codec: None,
            audio_codec: None,
            inspect_output: true,
            inspect_program: "ffprobe".to_string(),
            inspect_args: Vec::new(),
        }
    }
}

impl EncoderConfig {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }
}

/// Where jobs keep their state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStoreKind {
    Memory,
    #[default]
    File,
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Finished MP4 files, one per video
    pub library_dir: PathBuf,
    /// Per-job scratch directories for segment downloads
    pub temp_dir: PathBuf,
    /// JSON state files (jobs, catalog, quota)
    pub state_dir: PathBuf,
    pub job_store: JobStoreKind,
    /// Persist the video catalog and quota counters under `state_dir`
    pub persist_catalog: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = AppConfig::get_data_dir().unwrap_or_else(|_| PathBuf::from("data"));
        Self {
            library_dir: data_dir.join("library"),
            temp_dir: std::env::temp_dir().join("hls-vault"),
            state_dir: data_dir.join("state"),
            job_store: JobStoreKind::File,
            persist_catalog: true,
        }
    }
}

impl StorageConfig {
    pub fn jobs_file(&self) -> PathBuf {
        self.state_dir.join("jobs.json")
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.state_dir.join("videos.json")
    }

    pub fn quota_file(&self) -> PathBuf {
        self.state_dir.join("quota.json")
    }
}

/// Video submission rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub allowed_hosts: Vec<String>,
    /// Accept plain `http` stream URLs (local testing only)
    pub allow_insecure: bool,
    pub thumbnail_base: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: vec!["stream.mux.com".to_string()],
            allow_insecure: false,
            thumbnail_base: "https://image.mux.com".to_string(),
        }
    }
}

/// Free-tier limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub free_upload_limit: u64,
    pub free_download_limit: u64,
    pub enforce: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_upload_limit: 3,
            free_download_limit: 3,
            enforce: true,
        }
    }
}

/// Advanced configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub log_level: String, // "error", "warn", "info", "debug", "trace"
    /// Full `EnvFilter` directive; overrides `log_level` when set
    pub log_filter: Option<String>,
    /// Remove scratch directories left over from a previous run at startup
    pub cleanup_temp_on_start: bool,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_filter: None,
            cleanup_temp_on_start: true,
        }
    }
}

impl AdvancedConfig {
    /// Filter directive handed to the tracing subscriber
    pub fn tracing_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| format!("hls_vault={},axum=warn", self.log_level))
    }
}

impl AppConfig {
    /// Load configuration from the default location plus environment overrides
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from `path` (if it exists) plus environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::load_layered(path, ENV_PREFIX)
    }

    fn load_layered(path: &Path, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        if path.exists() {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Json),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("encoder.extra_args")
                .with_list_parse_key("catalog.allowed_hosts"),
        );

        let config: AppConfig = builder
            .build()
            .with_context(|| format!("Failed to read configuration from {:?}", path))?
            .try_deserialize()
            .with_context(|| "Failed to parse configuration")?;

        config.validate().with_context(|| "Invalid configuration")?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration as pretty JSON
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Saved configuration to: {:?}", path);
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(explicit));
        }

        let project_dirs = ProjectDirs::from("com", "hlsvault", "hls-vault")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    /// Get the application data directory
    pub fn get_data_dir() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "hlsvault", "hls-vault")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.data_dir().to_path_buf())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_address))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;

        if self.download.max_concurrent_segments == 0 {
            bail!("Segment concurrency must be greater than 0");
        }

        if self.download.max_concurrent_segments > 64 {
            bail!("Segment concurrency should not exceed 64");
        }

        if self.download.retry_attempts == 0 || self.download.retry_attempts > 10 {
            bail!("Retry attempts should be between 1 and 10");
        }

        if self.download.timeout_seconds == 0 || self.download.timeout_seconds > 600 {
            bail!("Timeout should be between 1 and 600 seconds");
        }

        if self.encoder.program.trim().is_empty() {
            bail!("Encoder program must not be empty");
        }

        if self.encoder.max_runtime_secs == 0 {
            bail!("Encoder max runtime must be greater than 0");
        }

        if self
            .catalog
            .allowed_hosts
            .iter()
            .any(|h| h.trim().is_empty())
        {
            bail!("Allowed hosts must not contain empty entries");
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.advanced.log_level.as_str())
        {
            bail!("Invalid log level: must be 'error', 'warn', 'info', 'debug', or 'trace'");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.download.strategy, DownloadStrategy::Encoder);
        assert_eq!(config.download.max_concurrent_segments, 8);
        assert_eq!(config.encoder.extra_args, vec!["-hide_banner".to_string()]);
        assert!(config.encoder.remux_transport_streams);
        assert_eq!(config.encoder.max_runtime(), Duration::from_secs(21_600));
        assert_eq!(config.quota.free_upload_limit, 3);
        assert_eq!(config.catalog.allowed_hosts, vec!["stream.mux.com".to_string()]);
    }

    #[test]
    fn test_invalid_config_validation() {
        let mut config = AppConfig::default();
        config.download.max_concurrent_segments = 0;
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.encoder.program = "  ".to_string();
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.server.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        config = AppConfig::default();
        config.advanced.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.download.strategy = DownloadStrategy::Segments;
        config.server.admin_token = Some("s3cret".to_string());
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_layered(&path, "HLS_VAULT_TEST_ROUNDTRIP").unwrap();
        assert_eq!(loaded.download.strategy, DownloadStrategy::Segments);
        assert_eq!(loaded.server.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "quota": { "free_download_limit": 10 } }"#).unwrap();

        let loaded = AppConfig::load_layered(&path, "HLS_VAULT_TEST_PARTIAL").unwrap();
        assert_eq!(loaded.quota.free_download_limit, 10);
        assert_eq!(loaded.quota.free_upload_limit, 3);
        assert_eq!(loaded.encoder.program, "ffmpeg");
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");

        std::env::set_var("HLS_VAULT_TEST_ENV__DOWNLOAD__RETRY_ATTEMPTS", "5");
        std::env::set_var("HLS_VAULT_TEST_ENV__ENCODER__PROGRAM", "/opt/ffmpeg/bin/ffmpeg");
        let loaded = AppConfig::load_layered(&path, "HLS_VAULT_TEST_ENV").unwrap();
        std::env::remove_var("HLS_VAULT_TEST_ENV__DOWNLOAD__RETRY_ATTEMPTS");
        std::env::remove_var("HLS_VAULT_TEST_ENV__ENCODER__PROGRAM");

        assert_eq!(loaded.download.retry_attempts, 5);
        assert_eq!(loaded.encoder.program, "/opt/ffmpeg/bin/ffmpeg");
    }

    #[test]
    fn test_tracing_filter() {
        let mut advanced = AdvancedConfig::default();
        assert_eq!(advanced.tracing_filter(), "hls_vault=info,axum=warn");
        advanced.log_filter = Some("debug".to_string());
        assert_eq!(advanced.tracing_filter(), "debug");
    }
}
