//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket address the HTTP server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Job admission limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum number of worker processes running at once (default 25)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Hard wall-clock limit per worker run in seconds (0 = unlimited)
    #[serde(default)]
    pub job_timeout_secs: u64,
}

fn default_max_concurrent_jobs() -> u32 {
    25
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_timeout_secs: 0,
        }
    }
}

/// External worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Media fetcher executable (yt-dlp compatible command line)
    #[serde(default = "default_worker_binary")]
    pub binary: String,
    /// ffmpeg executable used by the worker for merging and extraction
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
    /// Browser to borrow cookies from (passed as --cookies-from-browser)
    #[serde(default)]
    pub cookies_from_browser: Option<String>,
}

fn default_worker_binary() -> String {
    "yt-dlp".to_string()
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: default_worker_binary(),
            ffmpeg_binary: default_ffmpeg_binary(),
            cookies_from_browser: None,
        }
    }
}

/// Progress transport configuration (push sockets and pull streams)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// How long an admitted job waits for a consumer to attach
    #[serde(default = "default_sink_wait_secs")]
    pub sink_wait_secs: u64,
    /// Upper bound on a single push write
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Interval between keepalive pings on push sockets
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Read deadline, refreshed by any inbound frame
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    /// Capacity of the per-job pull queue
    #[serde(default = "default_pull_buffer")]
    pub pull_buffer: usize,
    /// Maximum accepted inbound frame size on push sockets
    #[serde(default = "default_read_limit_bytes")]
    pub read_limit_bytes: usize,
}

fn default_sink_wait_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    5
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_liveness_timeout_secs() -> u64 {
    60
}

fn default_pull_buffer() -> usize {
    20
}

fn default_read_limit_bytes() -> usize {
    512
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sink_wait_secs: default_sink_wait_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            pull_buffer: default_pull_buffer(),
            read_limit_bytes: default_read_limit_bytes(),
        }
    }
}

/// Progress filtering configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressConfig {
    /// Minimum spacing between forwarded progress updates
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// A 100% sample smaller than this is a fragment, not the whole job
    #[serde(default = "default_fragment_threshold_bytes")]
    pub fragment_threshold_bytes: u64,
}

fn default_min_interval_ms() -> u64 {
    1000
}

fn default_fragment_threshold_bytes() -> u64 {
    1024 * 1024
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            fragment_threshold_bytes: default_fragment_threshold_bytes(),
        }
    }
}

/// Output storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory finished downloads are written to
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    /// URL prefix under which finished downloads are served
    #[serde(default = "default_public_prefix")]
    pub public_prefix: String,
    /// Files older than this are removed by the sweeper
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Interval between sweeper passes
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Assumed slowest client throughput used for cleanup estimates (KiB/s)
    #[serde(default = "default_min_throughput_kbps")]
    pub min_throughput_kbps: u64,
    /// Fixed grace added to every cleanup estimate
    #[serde(default = "default_cleanup_buffer_secs")]
    pub cleanup_buffer_secs: u64,
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_public_prefix() -> String {
    "/downloads".to_string()
}

fn default_retention_hours() -> u64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_min_throughput_kbps() -> u64 {
    50
}

fn default_cleanup_buffer_secs() -> u64 {
    120
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
            public_prefix: default_public_prefix(),
            retention_hours: default_retention_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            min_throughput_kbps: default_min_throughput_kbps(),
            cleanup_buffer_secs: default_cleanup_buffer_secs(),
        }
    }
}

/// Metadata resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataConfig {
    /// Iframely-compatible endpoint, tried before the worker (disabled if None)
    #[serde(default)]
    pub iframely_url: Option<String>,
    /// Request timeout for the HTTP resolver
    #[serde(default = "default_metadata_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_metadata_timeout_secs() -> u64 {
    7
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            iframely_url: None,
            timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FETCH_BIND -> server.bind
    /// - FETCH_MAX_CONCURRENT_JOBS -> limits.max_concurrent_jobs
    /// - FETCH_JOB_TIMEOUT_SECS -> limits.job_timeout_secs
    /// - FETCH_WORKER_BINARY -> worker.binary
    /// - FETCH_COOKIES_FROM_BROWSER -> worker.cookies_from_browser (empty clears it)
    /// - FETCH_DOWNLOADS_DIR -> storage.downloads_dir
    /// - FETCH_IFRAMELY_URL -> metadata.iframely_url (empty clears it)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FETCH_BIND") {
            if !val.trim().is_empty() {
                self.server.bind = val;
            }
        }

        if let Ok(val) = env::var("FETCH_MAX_CONCURRENT_JOBS") {
            // Zero would deadlock admission; keep the existing value instead
            if let Ok(jobs) = val.parse::<u32>() {
                if jobs > 0 {
                    self.limits.max_concurrent_jobs = jobs;
                }
            }
        }

        if let Ok(val) = env::var("FETCH_JOB_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.limits.job_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("FETCH_WORKER_BINARY") {
            if !val.trim().is_empty() {
                self.worker.binary = val;
            }
        }

        if let Ok(val) = env::var("FETCH_COOKIES_FROM_BROWSER") {
            self.worker.cookies_from_browser = non_empty(val);
        }

        if let Ok(val) = env::var("FETCH_DOWNLOADS_DIR") {
            if !val.trim().is_empty() {
                self.storage.downloads_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FETCH_IFRAMELY_URL") {
            self.metadata.iframely_url = non_empty(val);
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, used when no config file exists
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

fn non_empty(val: String) -> Option<String> {
    let trimmed = val.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
