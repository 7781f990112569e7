//! Configuration data structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure containing all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global application settings.
    pub global: GlobalConfig,

    /// Media libraries to discover videos from.
    pub libraries: Vec<LibraryConfig>,
}

/// Global application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Temporary directory for CRF-search and encode scratch files.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Database connection settings.
    pub database: DatabaseConfig,

    /// Paths/names of the external tool binaries.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// VMAF targeting and size-limit settings.
    #[serde(default)]
    pub quality: QualityConfig,

    /// Analyzer batching and concurrency settings.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Database-busy retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Progress broadcast debouncing settings.
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Interval, in seconds, for each producer's polling fallback.
    #[serde(default = "default_poll_interval")]
    pub producer_poll_interval_seconds: u64,
}

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

/// External tool executable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Name or path of the `ab-av1` executable.
    #[serde(default = "default_ab_av1_path")]
    pub ab_av1_path: String,

    /// Name or path of the `mediainfo` executable.
    #[serde(default = "default_mediainfo_path")]
    pub mediainfo_path: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ab_av1_path: default_ab_av1_path(),
            mediainfo_path: default_mediainfo_path(),
        }
    }
}

/// VMAF targeting and size-limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Default target VMAF score for a CRF search.
    #[serde(default = "default_vmaf_target")]
    pub default_vmaf_target: u32,

    /// Lowest target VMAF the retry cascade is allowed to fall back to.
    #[serde(default = "default_vmaf_floor")]
    pub vmaf_target_floor: u32,

    /// Lower bound of the standard CRF search range.
    #[serde(default = "default_min_crf")]
    pub min_crf: u32,

    /// Upper bound of the standard CRF search range.
    #[serde(default = "default_max_crf")]
    pub max_crf: u32,

    /// Predicted-encode size limit, in bytes, above which a video is failed.
    #[serde(default = "default_size_limit_bytes")]
    pub size_limit_bytes: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            default_vmaf_target: default_vmaf_target(),
            vmaf_target_floor: default_vmaf_floor(),
            min_crf: default_min_crf(),
            max_crf: default_max_crf(),
            size_limit_bytes: default_size_limit_bytes(),
        }
    }
}

/// Analyzer batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Starting batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Minimum batch size the auto-tuner may shrink to.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Maximum batch size the auto-tuner may grow to.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum number of concurrent `mediainfo` chunks.
    #[serde(default = "default_max_chunk_concurrency")]
    pub max_chunk_concurrency: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            max_chunk_concurrency: default_max_chunk_concurrency(),
        }
    }
}

/// Database-busy retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts on a transient database error.
    #[serde(default = "default_db_busy_max_attempts")]
    pub db_busy_max_attempts: u32,

    /// Base delay, in milliseconds, for exponential backoff between retries.
    #[serde(default = "default_db_busy_base_delay_ms")]
    pub db_busy_base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            db_busy_max_attempts: default_db_busy_max_attempts(),
            db_busy_base_delay_ms: default_db_busy_base_delay_ms(),
        }
    }
}

/// Progress-broadcast debouncing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Minimum seconds between progress broadcasts for the same file.
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,

    /// Percent-delta that bypasses the debounce window.
    #[serde(default = "default_debounce_percent_delta")]
    pub debounce_percent_delta: f32,

    /// Interval, in seconds, for the encoder's stall-avoiding heartbeat.
    #[serde(default = "default_encoder_heartbeat_seconds")]
    pub encoder_heartbeat_seconds: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: default_debounce_seconds(),
            debounce_percent_delta: default_debounce_percent_delta(),
            encoder_heartbeat_seconds: default_encoder_heartbeat_seconds(),
        }
    }
}

/// A media library to discover videos from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root path of the library.
    pub path: PathBuf,

    /// Glob patterns excluded from CRF-search/encode dispatch.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/reencodarr")
}

fn default_ab_av1_path() -> String {
    "ab-av1".to_string()
}

fn default_mediainfo_path() -> String {
    "mediainfo".to_string()
}

fn default_vmaf_target() -> u32 {
    95
}

fn default_vmaf_floor() -> u32 {
    90
}

fn default_min_crf() -> u32 {
    8
}

fn default_max_crf() -> u32 {
    40
}

fn default_size_limit_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_batch_size() -> usize {
    8
}

fn default_min_batch_size() -> usize {
    5
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_chunk_concurrency() -> usize {
    4
}

fn default_db_busy_max_attempts() -> u32 {
    5
}

fn default_db_busy_base_delay_ms() -> u64 {
    50
}

fn default_poll_interval() -> u64 {
    2
}

fn default_debounce_seconds() -> u64 {
    5
}

fn default_debounce_percent_delta() -> f32 {
    50.0
}

fn default_encoder_heartbeat_seconds() -> u64 {
    10
}
