//! Determines the highest CRF that still meets the target VMAF for a Video.
//!
//! Single-slot: exactly one `ab-av1 crf-search` runs at a time. A start
//! request while already running is rejected with a broadcast skip-event,
//! never a recorded failure.

use std::collections::VecDeque;
use std::path::Path;

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::model::{QualityConfig, RetryConfig, ToolsConfig};
use crate::error::StoreError;
use crate::events::{EventBus, MediaEvent, StageEvent, StageResult};
use crate::parser::{self, Event, CRF_EXHAUSTED_MESSAGE};
use crate::process::{ExitOutcome, ProcessEvent, ProcessRunner};
use crate::rules::{self, Stage};
use crate::store::models::{FailureKind, FailureStage, Video};
use crate::store::{queries, transitions};

const ROLLING_BUFFER_CAPACITY: usize = 200;
const STANDARD_MIN_CRF: u32 = 8;
const STANDARD_MAX_CRF: u32 = 40;

/// Guards the single in-flight search slot. `try_lock` failing means a
/// search is already running and the request should be rejected.
pub struct CrfSearchWorker {
    busy: Mutex<()>,
}

impl Default for CrfSearchWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl CrfSearchWorker {
    pub fn new() -> Self {
        Self { busy: Mutex::new(()) }
    }

    /// Attempts to run a CRF search for `video`. Returns immediately with a
    /// skipped event if another search is already in flight.
    pub async fn try_run(
        &self,
        pool: &SqlitePool,
        event_bus: &EventBus,
        tools: &ToolsConfig,
        quality: &QualityConfig,
        retry: &RetryConfig,
        temp_dir: &Path,
        video: Video,
    ) {
        let Ok(_guard) = self.busy.try_lock() else {
            event_bus.publish_crf_search(StageEvent::completed(video.id, StageResult::Skipped));
            return;
        };

        run_search(pool, event_bus, tools, quality, retry, temp_dir, video, quality.default_vmaf_target, None).await;
    }
}

/// One attempt of the retry cascade: runs `ab-av1 crf-search` for `video` at
/// `target`, with an optional narrowed `(min, max)` CRF range, and resolves
/// success, retry, or terminal failure.
#[allow(clippy::too_many_arguments)]
async fn run_search(
    pool: &SqlitePool,
    event_bus: &EventBus,
    tools: &ToolsConfig,
    quality: &QualityConfig,
    retry: &RetryConfig,
    temp_dir: &Path,
    video: Video,
    target: u32,
    narrowed_range: Option<(u32, u32)>,
) {
    let (min_crf, max_crf) = narrowed_range.unwrap_or((quality.min_crf, quality.max_crf));

    let base = vec![
        "crf-search".to_string(),
        "--input".to_string(),
        video.path.clone(),
        "--min-vmaf".to_string(),
        target.to_string(),
        "--min-crf".to_string(),
        min_crf.to_string(),
        "--max-crf".to_string(),
        max_crf.to_string(),
        "--temp-dir".to_string(),
        temp_dir.display().to_string(),
    ];
    let args = rules::build_args(&video, Stage::CrfSearch, base, &[]);
    let command_line = format!("{} {}", tools.ab_av1_path, args.join(" "));

    let (_runner, mut rx) = match ProcessRunner::spawn(&tools.ab_av1_path, &args) {
        Ok(pair) => pair,
        Err(e) => {
            record_failure(pool, video.id, None, FailureKind::CommandError, &command_line, &e.to_string()).await;
            return;
        }
    };

    if let Err(e) = transitions::mark_as_crf_searching(pool, retry, video.id).await {
        record_transition_failure(pool, video.id, FailureStage::CrfSearch, &e).await;
        warn!(video_id = video.id, error = %e, "mark_as_crf_searching failed");
        return;
    }
    event_bus.publish_transition(crate::events::VideoStateTransition {
        video_id: video.id,
        new_state: crate::store::models::VideoState::CrfSearching,
    });
    event_bus.publish_crf_search(StageEvent::progress(video.id, 0.0, None, None));

    let mut rolling_buffer: VecDeque<String> = VecDeque::with_capacity(ROLLING_BUFFER_CAPACITY);
    let mut any_chosen = false;
    let mut saw_exhausted_message = false;

    let exit = loop {
        match rx.recv().await {
            Some(ProcessEvent::Line(line)) => {
                push_bounded(&mut rolling_buffer, line.clone());
                let event = parser::parse_line(&line);
                if matches!(
                    &event,
                    Event::SampleVmaf { .. } | Event::CandidateVmaf { .. } | Event::PredictedSize { .. }
                ) {
                    any_chosen |= handle_event(pool, event_bus, retry, &video, target, event).await;
                } else if let Event::FatalError { ref message } = event {
                    if message == CRF_EXHAUSTED_MESSAGE {
                        saw_exhausted_message = true;
                    }
                    handle_event(pool, event_bus, retry, &video, target, event).await;
                } else {
                    handle_event(pool, event_bus, retry, &video, target, event).await;
                }
            }
            Some(ProcessEvent::Partial(_)) => {}
            Some(ProcessEvent::Exit(outcome)) => break outcome,
            None => break ExitOutcome::PortDied { reason: "channel closed without exit event".to_string() },
        }
    };

    match exit {
        ExitOutcome::Code(0) => {
            finish_success(pool, event_bus, retry, &video, target, any_chosen).await;
        }
        ExitOutcome::Code(code) => {
            retry_or_fail(
                pool,
                event_bus,
                tools,
                quality,
                retry,
                temp_dir,
                video,
                target,
                narrowed_range,
                Some(code),
                saw_exhausted_message,
                &command_line,
                &rolling_buffer,
            )
            .await;
        }
        ExitOutcome::PortDied { reason } => {
            retry_or_fail(
                pool,
                event_bus,
                tools,
                quality,
                retry,
                temp_dir,
                video,
                target,
                narrowed_range,
                None,
                false,
                &format!("{command_line} ({reason})"),
                &rolling_buffer,
            )
            .await;
        }
    }
}

/// Dispatches one parsed line to the appropriate store/event side effect.
/// Returns `true` if this line resulted in a chosen Vmaf being recorded.
async fn handle_event(
    pool: &SqlitePool,
    event_bus: &EventBus,
    retry: &RetryConfig,
    video: &Video,
    target: u32,
    event: Event,
) -> bool {
    match event {
        Event::EncodingSample { sample_num, total_samples, crf } => {
            debug!(video_id = video.id, sample_num, total_samples, crf, "probing crf");
            false
        }
        Event::SampleVmaf { crf, score, percent, .. } | Event::CandidateVmaf { crf, score, percent } => {
            match queries::upsert_vmaf(pool, video.id, crf, score, percent, None, None, None, target as i64, &[], false)
                .await
            {
                Ok(vmaf) => event_bus.publish_media(MediaEvent::VmafUpserted(vmaf)),
                Err(e) => warn!(video_id = video.id, error = %e, "failed to upsert candidate vmaf"),
            }
            false
        }
        Event::PredictedSize { crf, score, predicted_size, size_unit, percent, time_taken, time_unit } => {
            let size_bytes = parser::size_to_bytes(predicted_size, &size_unit).unwrap_or(predicted_size);
            let time_seconds = parser::time_to_seconds(time_taken, &time_unit);
            let savings = crate::store::models::compute_savings(percent, video.size);

            if size_bytes > 10.0 * 1024.0 * 1024.0 * 1024.0 {
                warn!(video_id = video.id, crf, size_bytes, "predicted size exceeds 10 GiB, recording anyway");
            }

            match queries::upsert_vmaf(
                pool,
                video.id,
                crf,
                score,
                percent,
                time_seconds.map(|s| s as i64),
                Some(&size_bytes.to_string()),
                savings,
                target as i64,
                &[],
                true,
            )
            .await
            {
                Ok(vmaf) => {
                    event_bus.publish_media(MediaEvent::VmafUpserted(vmaf));
                    true
                }
                Err(e) => {
                    warn!(video_id = video.id, error = %e, "failed to upsert predicted-size vmaf");
                    false
                }
            }
        }
        Event::Progress { percent, fps, eta, .. } => {
            event_bus.publish_crf_search(StageEvent::progress(video.id, percent, fps, eta));
            false
        }
        Event::Success { crf } => {
            match queries::mark_vmaf_chosen(pool, video.id, crf).await {
                Ok(vmaf) => {
                    if let Some(size_str) = &vmaf.size {
                        if let Ok(size_bytes) = size_str.parse::<f64>() {
                            if size_bytes > 10.0 * 1024.0 * 1024.0 * 1024.0 {
                                record_size_limit_failure(pool, video.id, size_bytes).await;
                                if let Ok(failed) = transitions::mark_as_failed(pool, retry, video.id).await {
                                    event_bus.publish_transition(crate::events::VideoStateTransition {
                                        video_id: failed.id,
                                        new_state: failed.state,
                                    });
                                }
                            }
                        }
                    }
                    event_bus.publish_media(MediaEvent::VmafUpserted(vmaf));
                    true
                }
                Err(e) => {
                    warn!(video_id = video.id, error = %e, "failed to mark vmaf chosen on success line");
                    false
                }
            }
        }
        Event::Warning { message } => {
            warn!(video_id = video.id, message, "ab-av1 warning");
            false
        }
        Event::FatalError { message } => {
            warn!(video_id = video.id, message, "ab-av1 fatal error line");
            false
        }
        _ => false,
    }
}

async fn finish_success(
    pool: &SqlitePool,
    event_bus: &EventBus,
    retry: &RetryConfig,
    video: &Video,
    target: u32,
    any_chosen: bool,
) {
    let has_chosen = if any_chosen {
        true
    } else {
        match queries::chosen_vmaf_exists(pool, video.id).await {
            Ok(exists) => exists,
            Err(_) => false,
        }
    };

    let resolved = if has_chosen {
        true
    } else {
        auto_select(pool, event_bus, video.id, target).await
    };

    if !resolved {
        record_failure(
            pool,
            video.id,
            None,
            FailureKind::VmafCalculationFailure,
            "ab-av1 crf-search",
            "exit 0 but no vmaf could be chosen",
        )
        .await;
        return;
    }

    match transitions::mark_as_crf_searched(pool, retry, video.id).await {
        Ok(updated) => {
            event_bus.publish_transition(crate::events::VideoStateTransition {
                video_id: updated.id,
                new_state: updated.state,
            });
            event_bus.publish_crf_search(StageEvent::completed(video.id, StageResult::Success));
            info!(video_id = video.id, "crf search completed");
        }
        Err(e) => {
            record_transition_failure(pool, video.id, FailureStage::CrfSearch, &e).await;
            warn!(video_id = video.id, error = %e, "mark_as_crf_searched failed after successful search");
        }
    }
}

/// Among all Vmafs for the video: the lowest `percent` whose `score >=
/// target`, else the highest `score`. Returns whether a row was chosen.
async fn auto_select(pool: &SqlitePool, event_bus: &EventBus, video_id: i64, target: u32) -> bool {
    let vmafs = match queries::vmafs_for_video(pool, video_id).await {
        Ok(v) => v,
        Err(_) => return false,
    };
    if vmafs.is_empty() {
        return false;
    }

    let meeting_target: Vec<_> = vmafs.iter().filter(|v| v.score >= target as f64).collect();
    let chosen = if !meeting_target.is_empty() {
        meeting_target.iter().min_by_key(|v| v.percent).copied()
    } else {
        vmafs.iter().max_by(|a, b| a.score.total_cmp(&b.score))
    };

    match chosen {
        Some(vmaf) => match queries::mark_vmaf_chosen(pool, video_id, vmaf.crf).await {
            Ok(vmaf) => {
                event_bus.publish_media(MediaEvent::VmafUpserted(vmaf));
                true
            }
            Err(_) => false,
        },
        None => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn retry_or_fail(
    pool: &SqlitePool,
    event_bus: &EventBus,
    tools: &ToolsConfig,
    quality: &QualityConfig,
    retry: &RetryConfig,
    temp_dir: &Path,
    video: Video,
    target: u32,
    narrowed_range: Option<(u32, u32)>,
    exit_code: Option<i32>,
    saw_exhausted_message: bool,
    command_line: &str,
    rolling_buffer: &VecDeque<String>,
) {
    let was_narrowed = narrowed_range.is_some_and(|(min, max)| min > STANDARD_MIN_CRF || max < STANDARD_MAX_CRF);

    if was_narrowed {
        info!(video_id = video.id, "retrying crf search with full standard range");
        Box::pin(run_search(pool, event_bus, tools, quality, retry, temp_dir, video, target, None)).await;
        return;
    }

    if saw_exhausted_message && target >= quality.vmaf_target_floor {
        info!(video_id = video.id, target, "retrying crf search with decremented target");
        Box::pin(run_search(pool, event_bus, tools, quality, retry, temp_dir, video, target - 1, narrowed_range)).await;
        return;
    }

    let kind =
        if saw_exhausted_message { FailureKind::CrfOptimizationFailure } else { FailureKind::VmafCalculationFailure };
    let tail: Vec<String> = rolling_buffer.iter().rev().take(50).rev().cloned().collect();
    record_failure(
        pool,
        video.id,
        exit_code,
        kind,
        command_line,
        &tail.join("\n"),
    )
    .await;

    if let Ok(failed) = transitions::mark_as_failed(pool, retry, video.id).await {
        event_bus
            .publish_transition(crate::events::VideoStateTransition { video_id: failed.id, new_state: failed.state });
    }
    event_bus.publish_crf_search(StageEvent::completed(video.id, StageResult::Error));
}

async fn record_transition_failure(pool: &SqlitePool, video_id: i64, stage: FailureStage, err: &StoreError) {
    if !matches!(err, StoreError::RetriesExhausted { .. }) {
        return;
    }
    let context = serde_json::json!({ "summary": err.to_string() });
    if let Err(e) = queries::record_failure(pool, video_id, stage, FailureKind::DatabaseError, None, None, None, context)
        .await
    {
        warn!(video_id, error = %e, "failed to record database-busy failure");
    }
}

async fn record_failure(
    pool: &SqlitePool,
    video_id: i64,
    exit_code: Option<i32>,
    kind: FailureKind,
    command: &str,
    output_tail: &str,
) {
    let context = serde_json::json!({ "command": command });
    if let Err(e) = queries::record_failure(
        pool,
        video_id,
        FailureStage::CrfSearch,
        kind,
        exit_code,
        Some(command),
        Some(output_tail),
        context,
    )
    .await
    {
        warn!(video_id, error = %e, "failed to record crf-search failure");
    }
}

async fn record_size_limit_failure(pool: &SqlitePool, video_id: i64, size_bytes: f64) {
    let context = serde_json::json!({ "predicted_size_bytes": size_bytes, "limit_bytes": 10u64 * 1024 * 1024 * 1024 });
    if let Err(e) = queries::record_failure(
        pool,
        video_id,
        FailureStage::CrfSearch,
        FailureKind::SizeLimitExceeded,
        None,
        None,
        None,
        context,
    )
    .await
    {
        warn!(video_id, error = %e, "failed to record size-limit failure");
    }
}

fn push_bounded(buffer: &mut VecDeque<String>, line: String) {
    if buffer.len() == ROLLING_BUFFER_CAPACITY {
        buffer.pop_front();
    }
    buffer.push_back(line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_buffer_is_bounded() {
        let mut buffer = VecDeque::new();
        for i in 0..(ROLLING_BUFFER_CAPACITY + 50) {
            push_bounded(&mut buffer, format!("line {i}"));
        }
        assert_eq!(buffer.len(), ROLLING_BUFFER_CAPACITY);
        assert_eq!(buffer.front().unwrap(), &format!("line {}", 50));
    }

    #[tokio::test]
    async fn worker_try_lock_rejects_concurrent_start() {
        let worker = CrfSearchWorker::new();
        let _guard = worker.busy.try_lock().unwrap();
        assert!(worker.busy.try_lock().is_err());
    }
}
