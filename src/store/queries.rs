//! Read/write queries exposed to producers and stage workers.
//!
//! State transitions live in [`super::transitions`]; this module covers
//! everything else: queue selection, Vmaf upserts, and failure recording.

use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{DashboardStats, FailureKind, FailureStage, Video, VideoState, Vmaf};
use crate::error::StoreError;

/// Videos with `state = needs_analysis`, oldest first.
pub async fn videos_needing_analysis(pool: &SqlitePool, limit: i64) -> Result<Vec<Video>, StoreError> {
    let state = VideoState::NeedsAnalysis.as_str();
    sqlx::query_as::<_, Video>(
        "SELECT * FROM videos WHERE state = ?1 ORDER BY inserted_at ASC LIMIT ?2",
    )
    .bind(state)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(StoreError::from)
}

/// Videos with `state = analyzed`, not already AV1/Opus, excluding configured glob
/// patterns, largest-first so the biggest wins are processed first.
pub async fn videos_for_crf_search(pool: &SqlitePool, limit: i64) -> Result<Vec<Video>, StoreError> {
    let state = VideoState::Analyzed.as_str();
    let rows = sqlx::query_as::<_, Video>(
        "SELECT * FROM videos WHERE state = ?1 ORDER BY size DESC LIMIT ?2",
    )
    .bind(state)
    .bind(limit * 4) // over-fetch to allow for in-process codec/glob filtering
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter(|v| !v.is_already_av1_or_opus())
        .take(limit as usize)
        .collect())
}

/// Videos with `state = crf_searched` and a chosen Vmaf, oldest first.
pub async fn videos_for_encoding(pool: &SqlitePool, limit: i64) -> Result<Vec<Video>, StoreError> {
    let state = VideoState::CrfSearched.as_str();
    sqlx::query_as::<_, Video>(
        "SELECT * FROM videos WHERE state = ?1 AND chosen_vmaf_id IS NOT NULL ORDER BY inserted_at ASC LIMIT ?2",
    )
    .bind(state)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(StoreError::from)
}

/// Whether a chosen Vmaf row exists for the given video.
pub async fn chosen_vmaf_exists(pool: &SqlitePool, video_id: i64) -> Result<bool, StoreError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM vmafs WHERE video_id = ?1 AND chosen = 1")
        .bind(video_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Fetches a single video by id.
pub async fn get_video(pool: &SqlitePool, video_id: i64) -> Result<Video, StoreError> {
    sqlx::query_as::<_, Video>("SELECT * FROM videos WHERE id = ?1")
        .bind(video_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::VideoNotFound(video_id))
}

/// Fetches all Vmaf rows recorded for a video, most recent first.
pub async fn vmafs_for_video(pool: &SqlitePool, video_id: i64) -> Result<Vec<Vmaf>, StoreError> {
    sqlx::query_as::<_, Vmaf>("SELECT * FROM vmafs WHERE video_id = ?1 ORDER BY id DESC")
        .bind(video_id)
        .fetch_all(pool)
        .await
        .map_err(StoreError::from)
}

/// Upserts a Vmaf row keyed by `(video_id, crf)`. Re-measuring the same CRF
/// updates score/percent/chosen in place rather than inserting a duplicate.
pub async fn upsert_vmaf(
    pool: &SqlitePool,
    video_id: i64,
    crf: f64,
    score: f64,
    percent: i64,
    time: Option<i64>,
    size: Option<&str>,
    savings: Option<i64>,
    target: i64,
    params: &[String],
    chosen: bool,
) -> Result<Vmaf, StoreError> {
    let params_json = serde_json::to_string(params).unwrap_or_else(|_| "[]".to_string());
    let now = Utc::now();

    if chosen {
        // At most one chosen Vmaf per video.
        sqlx::query("UPDATE vmafs SET chosen = 0 WHERE video_id = ?1")
            .bind(video_id)
            .execute(pool)
            .await?;
    }

    let vmaf = sqlx::query_as::<_, Vmaf>(
        r#"
        INSERT INTO vmafs (video_id, crf, score, percent, time, size, savings, target, params, chosen, inserted_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
        ON CONFLICT(video_id, crf) DO UPDATE SET
            score = excluded.score,
            percent = excluded.percent,
            time = excluded.time,
            size = excluded.size,
            savings = excluded.savings,
            target = excluded.target,
            params = excluded.params,
            chosen = excluded.chosen,
            updated_at = excluded.updated_at
        RETURNING *
        "#,
    )
    .bind(video_id)
    .bind(crf)
    .bind(score)
    .bind(percent)
    .bind(time)
    .bind(size)
    .bind(savings)
    .bind(target)
    .bind(params_json)
    .bind(chosen)
    .bind(now)
    .fetch_one(pool)
    .await?;

    if chosen {
        sqlx::query("UPDATE videos SET chosen_vmaf_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(vmaf.id)
            .bind(now)
            .bind(video_id)
            .execute(pool)
            .await?;
    }

    Ok(vmaf)
}

/// Marks the Vmaf at the given CRF as chosen (used by CRF-Search's `Success` handler
/// and by auto-select), clearing `chosen` on any sibling row first.
pub async fn mark_vmaf_chosen(pool: &SqlitePool, video_id: i64, crf: f64) -> Result<Vmaf, StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE vmafs SET chosen = 0 WHERE video_id = ?1")
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE vmafs SET chosen = 1, updated_at = ?1 WHERE video_id = ?2 AND crf = ?3")
        .bind(Utc::now())
        .bind(video_id)
        .bind(crf)
        .execute(&mut *tx)
        .await?;

    let vmaf = sqlx::query_as::<_, Vmaf>("SELECT * FROM vmafs WHERE video_id = ?1 AND crf = ?2")
        .bind(video_id)
        .bind(crf)
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query("UPDATE videos SET chosen_vmaf_id = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(vmaf.id)
        .bind(Utc::now())
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(vmaf)
}

/// Records a failure against a video. Append-only, never mutated.
#[allow(clippy::too_many_arguments)]
pub async fn record_failure(
    pool: &SqlitePool,
    video_id: i64,
    stage: FailureStage,
    kind: FailureKind,
    exit_code: Option<i32>,
    command: Option<&str>,
    output_tail: Option<&str>,
    context: serde_json::Value,
) -> Result<i64, StoreError> {
    let id: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO failures (video_id, stage, kind, exit_code, command, output_tail, context, inserted_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING id
        "#,
    )
    .bind(video_id)
    .bind(stage)
    .bind(kind)
    .bind(exit_code)
    .bind(command)
    .bind(output_tail)
    .bind(context)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(id.0)
}

/// Aggregate dashboard counts, surfaced by the `queue-status` CLI command.
pub async fn get_dashboard_stats(pool: &SqlitePool) -> Result<DashboardStats, StoreError> {
    let counts: Vec<(String, i64)> = sqlx::query_as("SELECT state, COUNT(*) FROM videos GROUP BY state")
        .fetch_all(pool)
        .await?;

    let mut stats = DashboardStats {
        needs_analysis: 0,
        analyzed: 0,
        crf_searching: 0,
        crf_searched: 0,
        encoding: 0,
        encoded: 0,
        failed: 0,
        total_size_bytes: 0,
        vmaf_count: 0,
        total_savings_bytes: 0,
    };

    for (state, count) in counts {
        match state.as_str() {
            "needs_analysis" => stats.needs_analysis = count,
            "analyzed" => stats.analyzed = count,
            "crf_searching" => stats.crf_searching = count,
            "crf_searched" => stats.crf_searched = count,
            "encoding" => stats.encoding = count,
            "encoded" => stats.encoded = count,
            "failed" => stats.failed = count,
            _ => {}
        }
    }

    let (total_size,): (Option<i64>,) = sqlx::query_as("SELECT SUM(size) FROM videos")
        .fetch_one(pool)
        .await?;
    stats.total_size_bytes = total_size.unwrap_or(0);

    let (vmaf_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vmafs")
        .fetch_one(pool)
        .await?;
    stats.vmaf_count = vmaf_count;

    let (savings,): (Option<i64>,) = sqlx::query_as("SELECT SUM(savings) FROM vmafs WHERE chosen = 1")
        .fetch_one(pool)
        .await?;
    stats.total_savings_bytes = savings.unwrap_or(0);

    Ok(stats)
}

/// Whether the operator has paused a stage via the CLI. Cross-process: the
/// running orchestrator polls this alongside its normal eligibility query
/// rather than requiring a control socket to the `run` process.
pub async fn is_stage_paused(pool: &SqlitePool, stage: &str) -> Result<bool, StoreError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT paused FROM stage_controls WHERE stage = ?1")
        .bind(stage)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(paused,)| paused != 0).unwrap_or(false))
}

/// Sets a stage's operator-pause flag.
pub async fn set_stage_paused(pool: &SqlitePool, stage: &str, paused: bool) -> Result<(), StoreError> {
    sqlx::query("UPDATE stage_controls SET paused = ?1 WHERE stage = ?2")
        .bind(paused)
        .bind(stage)
        .execute(pool)
        .await?;
    Ok(())
}

/// Forces a video back to `needs_analysis` regardless of current state,
/// for the operator `force-reanalyze` command.
pub async fn force_reanalyze(pool: &SqlitePool, video_id: i64) -> Result<Video, StoreError> {
    sqlx::query("UPDATE videos SET state = ?1, chosen_vmaf_id = NULL, updated_at = ?2 WHERE id = ?3")
        .bind(VideoState::NeedsAnalysis.as_str())
        .bind(Utc::now())
        .bind(video_id)
        .execute(pool)
        .await?;
    get_video(pool, video_id).await
}

/// Pushes `video_id` onto a stage's manual-dispatch queue. Durable and
/// cross-process: the CLI's `force-reanalyze` and a running producer's
/// `force_enqueue` both write here, so either reaches the other.
pub async fn enqueue_manual(pool: &SqlitePool, stage: &str, video_id: i64) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO manual_queue (stage, video_id, inserted_at) VALUES (?1, ?2, ?3)")
        .bind(stage)
        .bind(video_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

/// Pops up to `limit` video ids off a stage's manual queue, most recently
/// enqueued first, deleting them as they're popped.
pub async fn pop_manual(pool: &SqlitePool, stage: &str, limit: i64) -> Result<Vec<i64>, StoreError> {
    if limit <= 0 {
        return Ok(Vec::new());
    }
    let rows: Vec<(i64, i64)> = sqlx::query_as("SELECT id, video_id FROM manual_queue WHERE stage = ?1 ORDER BY id DESC LIMIT ?2")
        .bind(stage)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let delete_sql = format!("DELETE FROM manual_queue WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&delete_sql);
    for id in &ids {
        query = query.bind(id);
    }
    query.execute(pool).await?;

    Ok(rows.into_iter().map(|(_, video_id)| video_id).collect())
}
