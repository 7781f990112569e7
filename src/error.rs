//! Error types for the encoding pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level application errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and parsing errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Config validation failed with {error_count} error(s)")]
    ValidationFailed { error_count: usize },
}

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Schema validation failed: {0}")]
    Schema(String),

    #[error("Semantic validation failed: {0}")]
    Semantic(String),

    #[error("Path validation failed: {0}")]
    Path(String),
}

/// Video store (persistence) errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid state transition for video {video_id}: {attempted}")]
    InvalidTransition { video_id: i64, attempted: String },

    #[error("Video {0} not found")]
    VideoNotFound(i64),

    #[error("Database busy, retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// External-process errors (ab-av1, mediainfo).
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Executable '{name}' not found in PATH")]
    ExecutableNotFound { name: String },

    #[error("Failed to spawn '{command}': {message}")]
    SpawnFailed { command: String, message: String },

    #[error("Process died abnormally: {reason}")]
    PortDied { reason: String },
}

/// Stage-worker errors (analyzer, CRF-search, encoder).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("ab-av1 crf-search failed with exit code {code}")]
    CrfSearchFailed { code: i32 },

    #[error("ab-av1 encode failed with exit code {code}")]
    EncodeFailed { code: i32 },

    #[error("mediainfo failed: {0}")]
    MediainfoFailed(String),

    #[error("worker is busy, request rejected")]
    Busy,

    #[error("post-processing failed: {0}")]
    PostProcessFailed(String),
}

/// Capability detection errors.
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("Failed to run '{command}': {message}")]
    CommandFailed { command: String, message: String },

    #[error("Required tool '{tool}' not found in PATH")]
    ToolNotFound { tool: String },
}
