//! Probes technical metadata for videos in `needs_analysis` state, in batches.

use std::collections::HashMap;

use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::model::{RetryConfig, ToolsConfig};
use crate::events::{EventBus, MediaEvent, StageEvent, StageResult};
use crate::process::{ExitOutcome, ProcessEvent, ProcessRunner};
use crate::store::models::{FailureKind, FailureStage, Video};
use crate::store::{queries, transitions};

/// Metadata extracted from a single `mediainfo` track set.
#[derive(Debug, Default)]
struct ProbedMetadata {
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
}

/// Runs `mediainfo` over `batch`, split into up to `max_chunk_concurrency`
/// concurrently-invoked chunks, and writes the result of each video to the
/// store. Per-video failures are isolated and never abort the rest of the
/// batch.
pub async fn run_batch(
    pool: &SqlitePool,
    event_bus: &EventBus,
    tools: &ToolsConfig,
    retry: &RetryConfig,
    batch: Vec<Video>,
    max_chunk_concurrency: usize,
) {
    if batch.is_empty() {
        return;
    }

    let chunks = split_into_chunks(batch, max_chunk_concurrency.max(1));
    let mut handles = Vec::new();

    for chunk in chunks {
        let pool = pool.clone();
        let event_bus = event_bus.clone();
        let mediainfo_path = tools.mediainfo_path.clone();
        let retry = retry.clone();
        handles.push(tokio::spawn(async move {
            process_chunk(&pool, &event_bus, &mediainfo_path, &retry, chunk).await;
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "analyzer chunk task panicked");
        }
    }
}

fn split_into_chunks(batch: Vec<Video>, max_chunks: usize) -> Vec<Vec<Video>> {
    let chunk_count = max_chunks.min(batch.len()).max(1);
    let chunk_size = batch.len().div_ceil(chunk_count);
    batch.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

async fn process_chunk(
    pool: &SqlitePool,
    event_bus: &EventBus,
    mediainfo_path: &str,
    retry: &RetryConfig,
    chunk: Vec<Video>,
) {
    let paths: Vec<String> = chunk.iter().map(|v| v.path.clone()).collect();
    let args: Vec<String> = ["--Output=JSON", "--LogFile=/dev/null", "--Full"]
        .into_iter()
        .map(str::to_string)
        .chain(paths.clone())
        .collect();

    let output = match invoke_mediainfo(mediainfo_path, &args).await {
        Ok(output) => output,
        Err(message) => {
            warn!(error = %message, "mediainfo invocation failed for entire chunk");
            for video in &chunk {
                record_analysis_failure(pool, video.id, None, "mediainfo invocation failed", &message).await;
                event_bus.publish_analyzer(StageEvent::completed(video.id, StageResult::Error));
            }
            return;
        }
    };

    let by_path = parse_mediainfo_output(&output);

    for video in chunk {
        match by_path.get(&video.path) {
            Some(metadata) => apply_metadata(pool, event_bus, retry, &video, metadata).await,
            None => {
                record_analysis_failure(pool, video.id, None, "mediainfo produced no entry for path", &video.path)
                    .await;
                event_bus.publish_analyzer(StageEvent::completed(video.id, StageResult::Error));
            }
        }
    }
}

async fn invoke_mediainfo(mediainfo_path: &str, args: &[String]) -> Result<String, String> {
    let (_runner, mut rx) = ProcessRunner::spawn(mediainfo_path, args).map_err(|e| e.to_string())?;

    let mut buffer = String::new();
    loop {
        match rx.recv().await {
            Some(ProcessEvent::Line(line)) => {
                buffer.push_str(&line);
                buffer.push('\n');
            }
            Some(ProcessEvent::Partial(chunk)) => buffer.push_str(&chunk),
            Some(ProcessEvent::Exit(ExitOutcome::Code(0))) => return Ok(buffer),
            Some(ProcessEvent::Exit(ExitOutcome::Code(code))) => {
                return Err(format!("mediainfo exited with code {code}"))
            }
            Some(ProcessEvent::Exit(ExitOutcome::PortDied { reason })) => return Err(reason),
            None => return Err("mediainfo exited without a status".to_string()),
        }
    }
}

/// Tolerates both `{"media": {...}}` (single file) and `[{"media": {...}}, ...]`
/// (multiple files) response shapes.
fn parse_mediainfo_output(raw: &str) -> HashMap<String, ProbedMetadata> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse mediainfo JSON");
            return HashMap::new();
        }
    };

    let entries: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![&value],
        _ => vec![],
    };

    let mut out = HashMap::new();
    for entry in entries {
        let Some(media) = entry.get("media") else { continue };
        let Some(path) = media.get("@ref").and_then(Value::as_str) else { continue };
        out.insert(path.to_string(), extract_metadata(media));
    }
    out
}

fn extract_metadata(media: &Value) -> ProbedMetadata {
    let tracks = media.get("track").and_then(Value::as_array).cloned().unwrap_or_default();

    let general = tracks.iter().find(|t| track_type(t) == Some("General"));
    let video_tracks: Vec<&Value> = tracks.iter().filter(|t| track_type(t) == Some("Video")).collect();
    let audio_tracks: Vec<&Value> = tracks.iter().filter(|t| track_type(t) == Some("Audio")).collect();

    let mut metadata = ProbedMetadata::default();

    metadata.size = general.and_then(|g| field_i64(g, "FileSize")).unwrap_or(0);
    metadata.duration = general.and_then(|g| field_f64(g, "Duration"));
    metadata.title = general.and_then(|g| field_str(g, "Title"));

    if let Some(video) = video_tracks.first() {
        metadata.width = field_i64(video, "Width").unwrap_or(0);
        metadata.height = field_i64(video, "Height").unwrap_or(0);
        metadata.frame_rate = field_f64(video, "FrameRate");
        metadata.bitrate =
            field_i64(video, "BitRate").or_else(|| general.and_then(|g| field_i64(g, "OverallBitRate"))).unwrap_or(0);
        metadata.hdr = classify_hdr(video);
    }
    metadata.video_codecs = video_tracks.iter().filter_map(|t| field_str(t, "Format")).collect();

    metadata.audio_codecs = audio_tracks.iter().filter_map(|t| field_str(t, "Format")).collect();
    metadata.max_audio_channels = audio_tracks.iter().filter_map(|t| field_i64(t, "Channels")).max();
    metadata.atmos = audio_tracks.iter().any(|t| {
        field_str(t, "Format_Commercial").is_some_and(|f| f.contains("Atmos"))
            || field_str(t, "Format_AdditionalFeatures").is_some_and(|f| f.contains("JOC"))
    });

    metadata
}

fn classify_hdr(video_track: &Value) -> Option<String> {
    let format = field_str(video_track, "HDR_Format")?;
    if format.contains("Dolby Vision") {
        Some("DV".to_string())
    } else if format.contains("HDR10+") {
        Some("HDR10+".to_string())
    } else {
        Some("HDR10".to_string())
    }
}

fn track_type(track: &Value) -> Option<&str> {
    track.get("@type").and_then(Value::as_str)
}

fn field_str(track: &Value, key: &str) -> Option<String> {
    track.get(key).and_then(Value::as_str).map(str::to_string)
}

fn field_i64(track: &Value, key: &str) -> Option<i64> {
    track.get(key).and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()).map(|f| f as i64)
}

fn field_f64(track: &Value, key: &str) -> Option<f64> {
    track.get(key).and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok())
}

async fn apply_metadata(pool: &SqlitePool, event_bus: &EventBus, retry: &RetryConfig, video: &Video, metadata: &ProbedMetadata) {
    let is_av1 = metadata.video_codecs.iter().any(|c| c.eq_ignore_ascii_case("av1"));
    let is_opus = metadata.audio_codecs.iter().any(|c| c.eq_ignore_ascii_case("opus"));

    if is_av1 || is_opus {
        match transitions::mark_as_reencoded(
            pool,
            retry,
            video.id,
            metadata.video_codecs.clone(),
            metadata.audio_codecs.clone(),
            metadata.size,
        )
        .await
        {
            Ok(updated) => {
                debug!(video_id = video.id, "codec fast-path: already AV1/Opus");
                event_bus.publish_media(MediaEvent::VideoUpserted(updated.clone()));
                publish_transition(event_bus, &updated);
                event_bus.publish_analyzer(StageEvent::completed(video.id, StageResult::Skipped));
            }
            Err(e) => record_or_warn(pool, video.id, FailureStage::Analysis, &e, "fast-path transition failed").await,
        }
        return;
    }

    if metadata.width <= 0 || metadata.height <= 0 || metadata.bitrate <= 0 || metadata.video_codecs.is_empty() {
        record_analysis_failure(
            pool,
            video.id,
            FailureKind::CommandError,
            None,
            "incomplete or invalid metadata",
            &format!("{metadata:?}"),
        )
        .await;
        event_bus.publish_analyzer(StageEvent::completed(video.id, StageResult::Error));
        return;
    }

    match transitions::mark_as_analyzed(
        pool,
        retry,
        video.id,
        metadata.width,
        metadata.height,
        metadata.bitrate,
        metadata.duration,
        metadata.frame_rate,
        metadata.video_codecs.clone(),
        metadata.audio_codecs.clone(),
        metadata.size,
        metadata.max_audio_channels,
        metadata.title.clone(),
        metadata.hdr.clone(),
        metadata.atmos,
    )
    .await
    {
        Ok(updated) => {
            info!(video_id = video.id, "analyzed");
            event_bus.publish_media(MediaEvent::VideoUpserted(updated.clone()));
            publish_transition(event_bus, &updated);
            event_bus.publish_analyzer(StageEvent::completed(video.id, StageResult::Success));
        }
        Err(e) => {
            let kind = if matches!(e, crate::error::StoreError::RetriesExhausted { .. }) {
                FailureKind::DatabaseError
            } else {
                FailureKind::CommandError
            };
            record_analysis_failure(pool, video.id, kind, None, "mark_as_analyzed rejected", &e.to_string()).await;
            event_bus.publish_analyzer(StageEvent::completed(video.id, StageResult::Error));
        }
    }
}

/// Records a failure for a transition error that has no separate
/// precondition-rejection path of its own (the codec fast-path only fails on
/// database contention, never on a rejected precondition).
async fn record_or_warn(
    pool: &SqlitePool,
    video_id: i64,
    stage: FailureStage,
    err: &crate::error::StoreError,
    summary: &str,
) {
    if matches!(err, crate::error::StoreError::RetriesExhausted { .. }) {
        let context = serde_json::json!({ "summary": summary });
        if let Err(e) =
            queries::record_failure(pool, video_id, stage, FailureKind::DatabaseError, None, None, None, context).await
        {
            warn!(video_id, error = %e, "failed to record database-busy failure");
        }
    } else {
        warn!(video_id, error = %err, summary, "transition failed");
    }
}

async fn record_analysis_failure(
    pool: &SqlitePool,
    video_id: i64,
    kind: FailureKind,
    exit_code: Option<i32>,
    summary: &str,
    detail: &str,
) {
    let context = serde_json::json!({ "summary": summary, "detail": detail });
    if let Err(e) =
        queries::record_failure(pool, video_id, FailureStage::Analysis, kind, exit_code, None, Some(detail), context)
            .await
    {
        warn!(video_id, error = %e, "failed to record analysis failure");
    }
}

fn publish_transition(event_bus: &EventBus, video: &Video) {
    event_bus.publish_transition(crate::events::VideoStateTransition { video_id: video.id, new_state: video.state });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_shape_is_parsed() {
        let raw = r#"{"media":{"@ref":"/a.mkv","track":[
            {"@type":"General","FileSize":"100","Duration":"10.0"},
            {"@type":"Video","Width":"1920","Height":"1080","BitRate":"5000000","Format":"HEVC"},
            {"@type":"Audio","Format":"AC-3","Channels":"6"}
        ]}}"#;
        let parsed = parse_mediainfo_output(raw);
        let meta = parsed.get("/a.mkv").unwrap();
        assert_eq!(meta.width, 1920);
        assert_eq!(meta.video_codecs, vec!["HEVC".to_string()]);
        assert_eq!(meta.max_audio_channels, Some(6));
    }

    #[test]
    fn array_shape_is_parsed() {
        let raw = r#"[
            {"media":{"@ref":"/a.mkv","track":[{"@type":"General","FileSize":"1"}]}},
            {"media":{"@ref":"/b.mkv","track":[{"@type":"General","FileSize":"2"}]}}
        ]"#;
        let parsed = parse_mediainfo_output(raw);
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains_key("/a.mkv"));
        assert!(parsed.contains_key("/b.mkv"));
    }

    #[test]
    fn av1_video_codec_is_detected() {
        let raw = r#"{"media":{"@ref":"/a.mkv","track":[
            {"@type":"Video","Width":"1920","Height":"1080","Format":"AV1"}
        ]}}"#;
        let parsed = parse_mediainfo_output(raw);
        let meta = parsed.get("/a.mkv").unwrap();
        assert!(meta.video_codecs.iter().any(|c| c.eq_ignore_ascii_case("av1")));
    }

    #[test]
    fn dolby_vision_classified_as_dv() {
        let raw = r#"{"media":{"@ref":"/a.mkv","track":[
            {"@type":"Video","Width":"1920","Height":"1080","HDR_Format":"Dolby Vision, Version 1.0"}
        ]}}"#;
        let parsed = parse_mediainfo_output(raw);
        assert_eq!(parsed.get("/a.mkv").unwrap().hdr.as_deref(), Some("DV"));
    }

    #[test]
    fn chunking_respects_max_concurrency() {
        let batch: Vec<Video> = (0..10)
            .map(|i| Video {
                id: i,
                path: format!("/v{i}.mkv"),
                library_id: None,
                service_id: None,
                service_type: None,
                width: None,
                height: None,
                bitrate: None,
                max_audio_channels: None,
                duration: None,
                frame_rate: None,
                video_codecs: vec![],
                audio_codecs: vec![],
                size: 0,
                title: None,
                hdr: None,
                atmos: false,
                state: crate::store::models::VideoState::NeedsAnalysis,
                chosen_vmaf_id: None,
                inserted_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
            .collect();
        let chunks = split_into_chunks(batch, 4);
        assert!(chunks.len() <= 4);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 10);
    }
}
