//! Produces an encoded artifact for a Video with a chosen Vmaf.
//!
//! Split into a Port-Holder (owns the OS process handle and line buffer,
//! survives a crash of the business-logic actor) and a Controller (the
//! logic that can restart and re-subscribe).

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::config::model::{ProgressConfig, RetryConfig, ToolsConfig};
use crate::error::StoreError;
use crate::events::{EventBus, StageEvent, StageResult};
use crate::parser::{self, Event};
use crate::post_process::{output_extension, OutputSink};
use crate::process::{ExitOutcome, ProcessEvent, ProcessRunner};
use crate::rules::{self, Stage};
use crate::store::models::{FailureKind, FailureStage, Video, Vmaf};
use crate::store::{queries, transitions};

const LINE_BUFFER_CAPACITY: usize = 200;

/// Keeps a spawned encode's [`PortHolder`] alive across a panicking
/// Controller task, keyed by video id, so a fresh Controller can recover the
/// still-running child instead of orphaning it.
pub type PortHolderRegistry = Arc<AsyncMutex<HashMap<i64, Arc<PortHolder>>>>;

/// Metadata describing the in-flight encode, recoverable by a restarted Controller.
#[derive(Debug, Clone)]
pub struct EncoderMetadata {
    pub video_id: i64,
    pub vmaf: Vmaf,
    pub output_path: PathBuf,
    pub os_pid: i32,
    pub command_line: String,
}

/// One update fanned out from the Port-Holder to all current subscribers.
#[derive(Debug, Clone)]
pub enum PortEvent {
    Line(String),
    Exit(ExitOutcomeOwned),
}

/// An owned, `Clone`-able mirror of [`ExitOutcome`] suitable for broadcast.
#[derive(Debug, Clone)]
pub enum ExitOutcomeOwned {
    Code(i32),
    PortDied { reason: String },
}

impl From<ExitOutcome> for ExitOutcomeOwned {
    fn from(value: ExitOutcome) -> Self {
        match value {
            ExitOutcome::Code(code) => ExitOutcomeOwned::Code(code),
            ExitOutcome::PortDied { reason } => ExitOutcomeOwned::PortDied { reason },
        }
    }
}

/// Owns the OS process handle and a replayable line buffer, independent of
/// whatever Controller instance is currently driving it.
pub struct PortHolder {
    runner: ProcessRunner,
    tx: broadcast::Sender<PortEvent>,
    buffer: StdMutex<VecDeque<String>>,
    metadata: EncoderMetadata,
}

impl PortHolder {
    /// Spawns the encoder process and begins forwarding its output into the
    /// broadcast channel, buffering lines for later replay.
    pub fn spawn(
        ab_av1_path: &str,
        args: &[String],
        mut metadata: EncoderMetadata,
    ) -> Result<Arc<Self>, crate::error::ProcessError> {
        let (runner, mut rx) = ProcessRunner::spawn(ab_av1_path, args)?;
        let (tx, _) = broadcast::channel(512);

        metadata.os_pid = runner.pgid();
        let holder = Arc::new(Self { runner, tx, buffer: StdMutex::new(VecDeque::new()), metadata });

        let holder_clone = holder.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ProcessEvent::Line(line) => {
                        holder_clone.push_buffered(line.clone());
                        let _ = holder_clone.tx.send(PortEvent::Line(line));
                    }
                    ProcessEvent::Partial(_) => {}
                    ProcessEvent::Exit(outcome) => {
                        let _ = holder_clone.tx.send(PortEvent::Exit(outcome.into()));
                        break;
                    }
                }
            }
        });

        Ok(holder)
    }

    fn push_buffered(&self, line: String) {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() == LINE_BUFFER_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }

    /// Replays buffered lines and returns a receiver for lines/exit yet to come.
    pub fn subscribe(&self) -> (Vec<String>, broadcast::Receiver<PortEvent>) {
        let buffered = self.buffer.lock().unwrap().iter().cloned().collect();
        (buffered, self.tx.subscribe())
    }

    pub fn get_metadata(&self) -> &EncoderMetadata {
        &self.metadata
    }

    pub fn get_os_pid(&self) -> i32 {
        self.runner.pgid()
    }

    /// Signals the process group and tears down the port. Used both for
    /// ordinary exit cleanup and operator-initiated cancellation.
    pub async fn kill(&self) {
        self.runner.shutdown(Duration::from_secs(5)).await;
    }
}

/// The business-logic actor. Stateless between calls beyond what it reads
/// back from the store and the Port-Holder's metadata, so a crashed
/// Controller can be replaced by a fresh one that re-subscribes.
pub struct EncoderController;

impl EncoderController {
    /// Starts an encode for `video` using its chosen `vmaf`, drives it to
    /// completion, and performs the terminal state transition.
    ///
    /// Checks `registry` first: if a Port-Holder for this video is already
    /// live (left behind by a Controller that panicked mid-encode), this
    /// re-subscribes to it instead of spawning a second `ab-av1` process.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        pool: &SqlitePool,
        event_bus: &EventBus,
        tools: &ToolsConfig,
        progress: &ProgressConfig,
        retry: &RetryConfig,
        temp_dir: &Path,
        registry: &PortHolderRegistry,
        sink: &dyn OutputSink,
        video: Video,
        vmaf: Vmaf,
    ) {
        let recovered = registry.lock().await.get(&video.id).cloned();

        let holder = if let Some(holder) = recovered {
            info!(video_id = video.id, pid = holder.get_os_pid(), "recovered live encoder port from prior controller");
            holder
        } else {
            if let Err(e) = transitions::mark_as_encoding(pool, retry, video.id).await {
                record_transition_failure(pool, video.id, &e).await;
                warn!(video_id = video.id, error = %e, "mark_as_encoding failed");
                return;
            }
            event_bus.publish_transition(crate::events::VideoStateTransition {
                video_id: video.id,
                new_state: crate::store::models::VideoState::Encoding,
            });

            let source_path = Path::new(&video.path);
            let ext = output_extension(source_path);
            let output_path = temp_dir.join(format!("{}.{ext}", video.id));

            let base = vec![
                "encode".to_string(),
                "--input".to_string(),
                video.path.clone(),
                "--output".to_string(),
                output_path.display().to_string(),
                "--crf".to_string(),
                vmaf.crf.to_string(),
            ];
            let args = rules::build_args(&video, Stage::Encode, base, &[]);
            let command_line = format!("{} {}", tools.ab_av1_path, args.join(" "));

            let metadata = EncoderMetadata {
                video_id: video.id,
                vmaf,
                output_path: output_path.clone(),
                os_pid: 0,
                command_line: command_line.clone(),
            };

            let holder = match PortHolder::spawn(&tools.ab_av1_path, &args, metadata) {
                Ok(holder) => holder,
                Err(e) => {
                    record_failure(pool, video.id, None, &command_line, &e.to_string()).await;
                    fail_video(pool, event_bus, retry, video.id).await;
                    return;
                }
            };
            registry.lock().await.insert(video.id, holder.clone());
            info!(video_id = video.id, pid = holder.get_os_pid(), "encoding started");
            holder
        };

        let command_line = holder.get_metadata().command_line.clone();
        let output_path = holder.get_metadata().output_path.clone();
        let source_path = Path::new(&video.path);
        event_bus.publish_encoding(StageEvent::progress(video.id, 0.0, None, None));

        let (buffered, mut rx) = holder.subscribe();
        let mut last_progress = StageEvent::progress(video.id, 0.0, None, None);
        let mut heartbeat = tokio::time::interval(Duration::from_secs(progress.encoder_heartbeat_seconds));
        heartbeat.tick().await; // consume the immediate first tick

        for line in buffered {
            if let Event::Progress { percent, fps, eta, .. } = parser::parse_line(&line) {
                last_progress = StageEvent::progress(video.id, percent, fps, eta);
            }
        }

        let exit = loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(PortEvent::Line(line)) => {
                            match parser::parse_line(&line) {
                                Event::Progress { percent, fps, eta, .. } => {
                                    last_progress = StageEvent::progress(video.id, percent, fps, eta);
                                    event_bus.publish_encoding(last_progress.clone());
                                }
                                Event::FileProgress { percent, .. } => {
                                    last_progress = StageEvent::progress(video.id, percent, None, None);
                                    event_bus.publish_encoding(last_progress.clone());
                                }
                                _ => {}
                            }
                        }
                        Ok(PortEvent::Exit(outcome)) => break outcome,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            break ExitOutcomeOwned::PortDied { reason: "port closed unexpectedly".to_string() }
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    event_bus.publish_encoding(last_progress.clone());
                }
            }
        };

        registry.lock().await.remove(&video.id);

        match exit {
            ExitOutcomeOwned::Code(0) => {
                match sink.swap_into_place(&output_path, source_path).await {
                    Ok(()) => match transitions::mark_as_encoded(pool, retry, video.id).await {
                        Ok(updated) => {
                            event_bus.publish_transition(crate::events::VideoStateTransition {
                                video_id: updated.id,
                                new_state: updated.state,
                            });
                            event_bus.publish_encoding(StageEvent::completed(video.id, StageResult::Success));
                            info!(video_id = video.id, "encoding completed");
                        }
                        Err(e) => {
                            record_transition_failure(pool, video.id, &e).await;
                            warn!(video_id = video.id, error = %e, "mark_as_encoded failed");
                        }
                    },
                    Err(e) => {
                        record_failure(pool, video.id, Some(0), &command_line, &format!("post-process swap failed: {e}"))
                            .await;
                        fail_video(pool, event_bus, retry, video.id).await;
                        event_bus.publish_encoding(StageEvent::completed(video.id, StageResult::Error));
                    }
                }
            }
            ExitOutcomeOwned::Code(code) => {
                record_failure(pool, video.id, Some(code), &command_line, "non-zero exit").await;
                fail_video(pool, event_bus, retry, video.id).await;
                event_bus.publish_encoding(StageEvent::completed(video.id, StageResult::Error));
            }
            ExitOutcomeOwned::PortDied { reason } => {
                record_failure(pool, video.id, None, &command_line, &reason).await;
                fail_video(pool, event_bus, retry, video.id).await;
                event_bus.publish_encoding(StageEvent::completed(video.id, StageResult::Error));
            }
        }
    }

    /// Operator-initiated cancellation: kills the process group and resets
    /// the Video to `crf_searched` so it can be re-dispatched. No failure
    /// is recorded.
    pub async fn reset(pool: &SqlitePool, event_bus: &EventBus, retry: &RetryConfig, holder: &PortHolder) {
        holder.kill().await;
        let video_id = holder.get_metadata().video_id;
        if let Ok(video) = transitions::reset_to_crf_searched(pool, retry, video_id).await {
            event_bus
                .publish_transition(crate::events::VideoStateTransition { video_id: video.id, new_state: video.state });
        }
    }
}

async fn record_failure(pool: &SqlitePool, video_id: i64, exit_code: Option<i32>, command: &str, tail: &str) {
    let context = serde_json::json!({ "command": command });
    if let Err(e) = queries::record_failure(
        pool,
        video_id,
        FailureStage::Encode,
        FailureKind::ProcessError,
        exit_code,
        Some(command),
        Some(tail),
        context,
    )
    .await
    {
        warn!(video_id, error = %e, "failed to record encode failure");
    }
}

async fn fail_video(pool: &SqlitePool, event_bus: &EventBus, retry: &RetryConfig, video_id: i64) {
    match transitions::mark_as_failed(pool, retry, video_id).await {
        Ok(updated) => {
            event_bus
                .publish_transition(crate::events::VideoStateTransition { video_id: updated.id, new_state: updated.state });
        }
        Err(e) => record_transition_failure(pool, video_id, &e).await,
    }
}

/// Records a `FailureKind::DatabaseError` when a transition exhausted its busy
/// retries, so the failure history distinguishes store contention from an
/// encoder/process-level failure.
async fn record_transition_failure(pool: &SqlitePool, video_id: i64, err: &StoreError) {
    if !matches!(err, StoreError::RetriesExhausted { .. }) {
        return;
    }
    let context = serde_json::json!({ "summary": err.to_string() });
    if let Err(e) = queries::record_failure(pool, video_id, FailureStage::Encode, FailureKind::DatabaseError, None, None, None, context).await
    {
        warn!(video_id, error = %e, "failed to record database-busy failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_outcome_conversion_preserves_code() {
        let owned: ExitOutcomeOwned = ExitOutcome::Code(7).into();
        matches!(owned, ExitOutcomeOwned::Code(7));
    }
}
