//! Row types for the `videos`, `vmafs`, `failures`, and `libraries` tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Video`], per the state machine in `transitions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum VideoState {
    NeedsAnalysis,
    Analyzed,
    CrfSearching,
    CrfSearched,
    Encoding,
    Encoded,
    Failed,
}

impl VideoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoState::NeedsAnalysis => "needs_analysis",
            VideoState::Analyzed => "analyzed",
            VideoState::CrfSearching => "crf_searching",
            VideoState::CrfSearched => "crf_searched",
            VideoState::Encoding => "encoding",
            VideoState::Encoded => "encoded",
            VideoState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for VideoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discovered media file tracked through the pipeline.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Video {
    pub id: i64,
    pub path: String,
    pub library_id: Option<i64>,
    pub service_id: Option<String>,
    pub service_type: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub bitrate: Option<i64>,
    pub max_audio_channels: Option<i64>,
    pub duration: Option<f64>,
    pub frame_rate: Option<f64>,
    #[sqlx(json)]
    pub video_codecs: Vec<String>,
    #[sqlx(json)]
    pub audio_codecs: Vec<String>,
    pub size: i64,
    pub title: Option<String>,
    pub hdr: Option<String>,
    pub atmos: bool,
    pub state: VideoState,
    pub chosen_vmaf_id: Option<i64>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    /// The codec fast-path: AV1 video or Opus audio bypasses CRF search/encode entirely.
    pub fn is_already_av1_or_opus(&self) -> bool {
        self.video_codecs.iter().any(|c| c.eq_ignore_ascii_case("av1"))
            || self.audio_codecs.iter().any(|c| c.eq_ignore_ascii_case("opus"))
    }

    pub fn is_hdr(&self) -> bool {
        matches!(self.hdr.as_deref(), Some("HDR10") | Some("HDR10+") | Some("DV"))
    }
}

/// A single CRF/VMAF measurement for a [`Video`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Vmaf {
    pub id: i64,
    pub video_id: i64,
    pub crf: f64,
    pub score: f64,
    pub percent: i64,
    pub time: Option<i64>,
    pub size: Option<String>,
    pub savings: Option<i64>,
    pub target: i64,
    #[sqlx(json)]
    pub params: Vec<String>,
    pub chosen: bool,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Computes `savings = max(0, (100 - percent) / 100 * video_size)`.
pub fn compute_savings(percent: i64, video_size: i64) -> Option<i64> {
    if percent < 0 || video_size < 0 {
        return None;
    }
    let percent = percent as f64;
    let video_size = video_size as f64;
    let savings = ((100.0 - percent) / 100.0 * video_size).max(0.0);
    Some(savings.round() as i64)
}

/// The pipeline stage a [`FailureRecord`] occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum FailureStage {
    Analysis,
    CrfSearch,
    Encode,
}

/// The kind of failure recorded against a [`Video`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum FailureKind {
    CommandError,
    ProcessError,
    Timeout,
    VmafCalculationFailure,
    CrfOptimizationFailure,
    SizeLimitExceeded,
    DatabaseError,
}

/// An append-only failure log entry for a [`Video`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FailureRecord {
    pub id: i64,
    pub video_id: i64,
    pub stage: FailureStage,
    pub kind: FailureKind,
    pub exit_code: Option<i64>,
    pub command: Option<String>,
    pub output_tail: Option<String>,
    #[sqlx(json)]
    pub context: serde_json::Value,
    pub inserted_at: DateTime<Utc>,
}

/// A discovery root, mapping a filesystem path to an id for `videos.library_id`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Library {
    pub id: i64,
    pub path: String,
    #[sqlx(json)]
    pub exclude_globs: Vec<String>,
}

/// Aggregate counts exposed to the (out-of-scope) dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub needs_analysis: i64,
    pub analyzed: i64,
    pub crf_searching: i64,
    pub crf_searched: i64,
    pub encoding: i64,
    pub encoded: i64,
    pub failed: i64,
    pub total_size_bytes: i64,
    pub vmaf_count: i64,
    pub total_savings_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn savings_formula_matches_spec() {
        // 1_073_741_824 byte video at 51% predicted size.
        assert_eq!(compute_savings(51, 1_073_741_824), Some(526_133_494));
    }

    #[test]
    fn savings_is_never_negative() {
        assert_eq!(compute_savings(150, 1000), Some(0));
    }

    #[test]
    fn video_state_round_trips_through_str() {
        assert_eq!(VideoState::CrfSearching.as_str(), "crf_searching");
    }
}
