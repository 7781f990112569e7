//! Runs once at startup, before any producer starts, to reset Videos left
//! mid-transition by a prior crash and reap any leftover child processes.

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::model::RetryConfig;
use crate::process::reaper::kill_stale_pipeline_processes;
use crate::store::models::VideoState;
use crate::store::transitions;

/// The four-step startup reaper: reset orphaned crf-searching and encoding
/// videos, sweep crf_searched videos with no chosen vmaf, then kill any
/// stray pipeline processes left by a prior crash.
pub async fn reap(pool: &SqlitePool, retry: &RetryConfig) {
    reset_orphaned_crf_searching(pool, retry).await;
    reset_orphaned_encoding(pool, retry).await;
    reset_crf_searched_without_vmaf(pool).await;
    kill_stale_pipeline_processes();
}

/// Resets every `crf_searching` Video back to `analyzed`. Exposed (not just
/// used by [`reap`]) because `reset-worker --stage crf-search` invokes the
/// same recovery after killing the stage's process group.
pub async fn reset_orphaned_crf_searching(pool: &SqlitePool, retry: &RetryConfig) {
    let ids = video_ids_in_state(pool, VideoState::CrfSearching).await;
    for id in ids {
        match transitions::reset_to_analyzed(pool, retry, id).await {
            Ok(_) => info!(video_id = id, "reaped: crf_searching -> analyzed"),
            Err(e) => warn!(video_id = id, error = %e, "failed to reap crf_searching video"),
        }
    }
}

/// Resets every `encoding` Video to `crf_searched` (if a chosen Vmaf
/// exists) or `analyzed`. Also used directly by `reset-worker --stage encoder`.
pub async fn reset_orphaned_encoding(pool: &SqlitePool, retry: &RetryConfig) {
    let ids = video_ids_in_state(pool, VideoState::Encoding).await;
    for id in ids {
        let has_chosen = crate::store::queries::chosen_vmaf_exists(pool, id).await.unwrap_or(false);
        let result = if has_chosen {
            transitions::reset_to_crf_searched(pool, retry, id).await
        } else {
            transitions::reset_to_analyzed(pool, retry, id).await
        };
        match result {
            Ok(video) => info!(video_id = id, new_state = %video.state, "reaped orphaned encode"),
            Err(e) => warn!(video_id = id, error = %e, "failed to reap encoding video"),
        }
    }
}

async fn reset_crf_searched_without_vmaf(pool: &SqlitePool) {
    let ids = video_ids_in_state(pool, VideoState::CrfSearched).await;
    for id in ids {
        let has_chosen = crate::store::queries::chosen_vmaf_exists(pool, id).await.unwrap_or(false);
        if has_chosen {
            continue;
        }
        // There is no direct `crf_searched -> analyzed` transition in the
        // store; this recovers via a raw update instead. A video stuck
        // `crf_searched` with no chosen vmaf should be unreachable (the
        // guarded transition requires a chosen vmaf to already exist), but
        // this sweep covers it defensively.
        match force_reset_to_analyzed(pool, id).await {
            Ok(()) => info!(video_id = id, "reaped: crf_searched (no chosen vmaf) -> analyzed"),
            Err(e) => warn!(video_id = id, error = %e, "failed to reap crf_searched video"),
        }
    }
}

async fn force_reset_to_analyzed(pool: &SqlitePool, video_id: i64) -> Result<(), crate::error::StoreError> {
    sqlx::query("UPDATE videos SET state = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(VideoState::Analyzed.as_str())
        .bind(chrono::Utc::now())
        .bind(video_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn video_ids_in_state(pool: &SqlitePool, state: VideoState) -> Vec<i64> {
    sqlx::query_as::<_, (i64,)>("SELECT id FROM videos WHERE state = ?1")
        .bind(state.as_str())
        .fetch_all(pool)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(id,)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn insert_video(pool: &SqlitePool, path: &str, state: VideoState) -> i64 {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO videos (path, video_codecs, audio_codecs, size, state, atmos) VALUES (?1, '[]', '[]', 0, ?2, 0) RETURNING id",
        )
        .bind(path)
        .bind(state.as_str())
        .fetch_one(pool)
        .await
        .unwrap();
        row.0
    }

    async fn fetch_state(pool: &SqlitePool, id: i64) -> VideoState {
        crate::store::queries::get_video(pool, id).await.unwrap().state
    }

    #[tokio::test]
    async fn reap_resets_every_orphaned_state_correctly() {
        let pool = memory_pool().await;

        let v1 = insert_video(&pool, "/v1.mkv", VideoState::CrfSearching).await;
        let v2 = insert_video(&pool, "/v2.mkv", VideoState::Encoding).await;
        let v3 = insert_video(&pool, "/v3.mkv", VideoState::Encoding).await;
        let v4 = insert_video(&pool, "/v4.mkv", VideoState::CrfSearched).await;

        // v2 has a chosen vmaf; v3 does not.
        sqlx::query(
            "INSERT INTO vmafs (video_id, crf, score, percent, target, params, chosen, inserted_at, updated_at) VALUES (?1, 26.0, 95.0, 50, 95, '[]', 1, datetime('now'), datetime('now'))",
        )
        .bind(v2)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("UPDATE videos SET chosen_vmaf_id = (SELECT id FROM vmafs WHERE video_id = ?1) WHERE id = ?1")
            .bind(v2)
            .execute(&pool)
            .await
            .unwrap();

        reap(&pool, &RetryConfig::default()).await;

        assert_eq!(fetch_state(&pool, v1).await, VideoState::Analyzed);
        assert_eq!(fetch_state(&pool, v2).await, VideoState::CrfSearched);
        assert_eq!(fetch_state(&pool, v3).await, VideoState::Analyzed);
        assert_eq!(fetch_state(&pool, v4).await, VideoState::Analyzed);
    }
}
