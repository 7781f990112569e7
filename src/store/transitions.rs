//! Guarded state transitions over [`VideoState`].
//!
//! Every transition runs inside a serializable `sqlx` transaction
//! (`BEGIN IMMEDIATE` on SQLite) so two concurrent workers can never both
//! win a transition on the same video. A failed precondition returns
//! [`StoreError::InvalidTransition`] and leaves the row untouched.

use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{Video, VideoState};
use crate::config::model::RetryConfig;
use crate::error::StoreError;

/// Acquires the write lock, retrying with backoff if SQLite reports the
/// database busy. Once acquired the rest of the transaction body runs
/// without contention, so only the acquisition itself needs to retry.
async fn begin_immediate(
    pool: &SqlitePool,
    retry: &RetryConfig,
) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, StoreError> {
    // `pool.begin()` issues a plain deferred `BEGIN`; SQLite then refuses a
    // second `BEGIN IMMEDIATE` on the same handle. `begin_with` opens the
    // transaction with the given statement directly, so this is the actual
    // write-lock acquisition, not a best-effort upgrade.
    super::with_busy_retry(retry.db_busy_max_attempts, retry.db_busy_base_delay_ms, || async {
        pool.begin_with("BEGIN IMMEDIATE").await.map_err(StoreError::from)
    })
    .await
}

/// `needs_analysis | analyzed -> analyzed`, requires positive bitrate/width/height
/// and non-empty video codecs (duration, when present, must be positive).
#[allow(clippy::too_many_arguments)]
pub async fn mark_as_analyzed(
    pool: &SqlitePool,
    retry: &RetryConfig,
    video_id: i64,
    width: i64,
    height: i64,
    bitrate: i64,
    duration: Option<f64>,
    frame_rate: Option<f64>,
    video_codecs: Vec<String>,
    audio_codecs: Vec<String>,
    size: i64,
    max_audio_channels: Option<i64>,
    title: Option<String>,
    hdr: Option<String>,
    atmos: bool,
) -> Result<Video, StoreError> {
    if width <= 0 || height <= 0 || bitrate <= 0 || video_codecs.is_empty() {
        return Err(invalid(video_id, "mark_as_analyzed: precondition failed"));
    }
    if let Some(d) = duration {
        if d <= 0.0 {
            return Err(invalid(video_id, "mark_as_analyzed: duration must be positive when present"));
        }
    }

    let mut tx = begin_immediate(pool, retry).await?;
    let current = fetch_for_update(&mut tx, video_id).await?;
    if !matches!(current.state, VideoState::NeedsAnalysis | VideoState::Analyzed) {
        return Err(invalid(video_id, format!("mark_as_analyzed: invalid from state {}", current.state)));
    }

    let now = Utc::now();
    sqlx::query(
        r#"
        UPDATE videos SET
            state = ?1, width = ?2, height = ?3, bitrate = ?4, duration = ?5, frame_rate = ?6,
            video_codecs = ?7, audio_codecs = ?8, size = ?9, max_audio_channels = ?10,
            title = ?11, hdr = ?12, atmos = ?13, updated_at = ?14
        WHERE id = ?15
        "#,
    )
    .bind(VideoState::Analyzed.as_str())
    .bind(width)
    .bind(height)
    .bind(bitrate)
    .bind(duration)
    .bind(frame_rate)
    .bind(serde_json::to_string(&video_codecs).unwrap())
    .bind(serde_json::to_string(&audio_codecs).unwrap())
    .bind(size)
    .bind(max_audio_channels)
    .bind(title)
    .bind(hdr)
    .bind(atmos)
    .bind(now)
    .bind(video_id)
    .execute(&mut *tx)
    .await?;

    let video = fetch_for_update(&mut tx, video_id).await?;
    tx.commit().await?;
    Ok(video)
}

/// Codec fast-path: any state -> `encoded`, requires AV1 video or Opus audio.
pub async fn mark_as_reencoded(
    pool: &SqlitePool,
    retry: &RetryConfig,
    video_id: i64,
    video_codecs: Vec<String>,
    audio_codecs: Vec<String>,
    size: i64,
) -> Result<Video, StoreError> {
    let has_av1 = video_codecs.iter().any(|c| c.eq_ignore_ascii_case("av1"));
    let has_opus = audio_codecs.iter().any(|c| c.eq_ignore_ascii_case("opus"));
    if !has_av1 && !has_opus {
        return Err(invalid(video_id, "mark_as_reencoded: requires AV1 video or Opus audio"));
    }

    let mut tx = begin_immediate(pool, retry).await?;
    let current = fetch_for_update(&mut tx, video_id).await?;
    if current.state == VideoState::Encoded {
        tx.commit().await?;
        return Ok(current);
    }

    let now = Utc::now();
    sqlx::query(
        "UPDATE videos SET state = ?1, video_codecs = ?2, audio_codecs = ?3, size = ?4, updated_at = ?5 WHERE id = ?6",
    )
    .bind(VideoState::Encoded.as_str())
    .bind(serde_json::to_string(&video_codecs).unwrap())
    .bind(serde_json::to_string(&audio_codecs).unwrap())
    .bind(size)
    .bind(now)
    .bind(video_id)
    .execute(&mut *tx)
    .await?;

    let video = fetch_for_update(&mut tx, video_id).await?;
    tx.commit().await?;
    Ok(video)
}

/// `analyzed -> crf_searching`, called once the worker has successfully spawned.
pub async fn mark_as_crf_searching(pool: &SqlitePool, retry: &RetryConfig, video_id: i64) -> Result<Video, StoreError> {
    transition_simple(pool, retry, video_id, &[VideoState::Analyzed], VideoState::CrfSearching).await
}

/// `crf_searching -> crf_searched`, requires a chosen Vmaf to already exist.
pub async fn mark_as_crf_searched(pool: &SqlitePool, retry: &RetryConfig, video_id: i64) -> Result<Video, StoreError> {
    let mut tx = begin_immediate(pool, retry).await?;
    let current = fetch_for_update(&mut tx, video_id).await?;
    if current.state != VideoState::CrfSearching {
        return Err(invalid(video_id, format!("mark_as_crf_searched: invalid from state {}", current.state)));
    }
    if current.chosen_vmaf_id.is_none() {
        return Err(invalid(video_id, "mark_as_crf_searched: no chosen vmaf"));
    }

    sqlx::query("UPDATE videos SET state = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(VideoState::CrfSearched.as_str())
        .bind(Utc::now())
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    let video = fetch_for_update(&mut tx, video_id).await?;
    tx.commit().await?;
    Ok(video)
}

/// `crf_searched -> encoding`, requires `chosen_vmaf_id` to be set.
pub async fn mark_as_encoding(pool: &SqlitePool, retry: &RetryConfig, video_id: i64) -> Result<Video, StoreError> {
    let mut tx = begin_immediate(pool, retry).await?;
    let current = fetch_for_update(&mut tx, video_id).await?;
    if current.state != VideoState::CrfSearched {
        return Err(invalid(video_id, format!("mark_as_encoding: invalid from state {}", current.state)));
    }
    if current.chosen_vmaf_id.is_none() {
        return Err(invalid(video_id, "mark_as_encoding: chosen_vmaf_id is null"));
    }

    sqlx::query("UPDATE videos SET state = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(VideoState::Encoding.as_str())
        .bind(Utc::now())
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    let video = fetch_for_update(&mut tx, video_id).await?;
    tx.commit().await?;
    Ok(video)
}

/// `encoding -> encoded`, called after the post-processor swap succeeds.
pub async fn mark_as_encoded(pool: &SqlitePool, retry: &RetryConfig, video_id: i64) -> Result<Video, StoreError> {
    transition_simple(pool, retry, video_id, &[VideoState::Encoding], VideoState::Encoded).await
}

/// Any non-`encoded` state -> `failed`. Unlike the other transitions this one
/// has no source-state precondition beyond "not already encoded" — failures
/// can originate from analysis, CRF-search, or encode.
pub async fn mark_as_failed(pool: &SqlitePool, retry: &RetryConfig, video_id: i64) -> Result<Video, StoreError> {
    let mut tx = begin_immediate(pool, retry).await?;
    let current = fetch_for_update(&mut tx, video_id).await?;
    if current.state == VideoState::Encoded {
        return Err(invalid(video_id, "mark_as_failed: video already encoded"));
    }

    sqlx::query("UPDATE videos SET state = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(VideoState::Failed.as_str())
        .bind(Utc::now())
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    let video = fetch_for_update(&mut tx, video_id).await?;
    tx.commit().await?;
    Ok(video)
}

/// Reset path used by the orphan reaper: `crf_searching | encoding -> analyzed`.
pub async fn reset_to_analyzed(pool: &SqlitePool, retry: &RetryConfig, video_id: i64) -> Result<Video, StoreError> {
    transition_simple(pool, retry, video_id, &[VideoState::CrfSearching, VideoState::Encoding], VideoState::Analyzed)
        .await
}

/// Reset path used by the orphan reaper: `encoding -> crf_searched` when a chosen Vmaf exists.
pub async fn reset_to_crf_searched(pool: &SqlitePool, retry: &RetryConfig, video_id: i64) -> Result<Video, StoreError> {
    let mut tx = begin_immediate(pool, retry).await?;
    let current = fetch_for_update(&mut tx, video_id).await?;
    if current.state != VideoState::Encoding {
        return Err(invalid(video_id, format!("reset_to_crf_searched: invalid from state {}", current.state)));
    }
    if current.chosen_vmaf_id.is_none() {
        return Err(invalid(video_id, "reset_to_crf_searched: no chosen vmaf"));
    }

    sqlx::query("UPDATE videos SET state = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(VideoState::CrfSearched.as_str())
        .bind(Utc::now())
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    let video = fetch_for_update(&mut tx, video_id).await?;
    tx.commit().await?;
    Ok(video)
}

async fn transition_simple(
    pool: &SqlitePool,
    retry: &RetryConfig,
    video_id: i64,
    from: &[VideoState],
    to: VideoState,
) -> Result<Video, StoreError> {
    let mut tx = begin_immediate(pool, retry).await?;
    let current = fetch_for_update(&mut tx, video_id).await?;
    if !from.contains(&current.state) {
        return Err(invalid(video_id, format!("invalid transition from {} to {}", current.state, to)));
    }

    sqlx::query("UPDATE videos SET state = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    let video = fetch_for_update(&mut tx, video_id).await?;
    tx.commit().await?;
    Ok(video)
}

async fn fetch_for_update(tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>, video_id: i64) -> Result<Video, StoreError> {
    sqlx::query_as::<_, Video>("SELECT * FROM videos WHERE id = ?1")
        .bind(video_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::VideoNotFound(video_id))
}

fn invalid(video_id: i64, attempted: impl Into<String>) -> StoreError {
    StoreError::InvalidTransition { video_id, attempted: attempted.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_error_carries_message() {
        let err = invalid(42, "mark_as_encoding: chosen_vmaf_id is null");
        match err {
            StoreError::InvalidTransition { attempted, .. } => {
                assert!(attempted.contains("chosen_vmaf_id"));
            }
            _ => panic!("expected InvalidTransition"),
        }
    }
}
