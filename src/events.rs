//! In-process pub/sub: a simple topic → subscriber map with broadcast
//! fan-out. Producers subscribe for wake-up; UI subscribers subscribe for
//! display. No ordering is guaranteed across topics, only within one.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::models::{Video, Vmaf};

const CHANNEL_CAPACITY: usize = 256;

/// `video_state_transitions` topic payload.
#[derive(Debug, Clone, Serialize)]
pub struct VideoStateTransition {
    pub video_id: i64,
    pub new_state: crate::store::models::VideoState,
}

/// `media_events` topic payload.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    VideoUpserted(Video),
    VmafUpserted(Vmaf),
}

/// The discriminated outcome of a stage attempt, shared by all three
/// per-stage progress topics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    Success,
    Skipped,
    Error,
}

/// Common progress/completion envelope for `crf_search_events`,
/// `encoding_events`, and `analyzer_events`.
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub video_id: i64,
    pub percent: Option<f64>,
    pub fps: Option<f64>,
    pub eta: Option<f64>,
    pub filename: Option<String>,
    pub result: Option<StageResult>,
}

impl StageEvent {
    /// A bare progress update with no terminal result yet.
    pub fn progress(video_id: i64, percent: f64, fps: Option<f64>, eta: Option<f64>) -> Self {
        Self { video_id, percent: Some(percent), fps, eta, filename: None, result: None }
    }

    /// A terminal completion envelope.
    pub fn completed(video_id: i64, result: StageResult) -> Self {
        Self { video_id, percent: None, fps: None, eta: None, filename: None, result: Some(result) }
    }
}

/// The process-wide event bus. Cheap to clone; every clone shares the same
/// underlying channels.
#[derive(Clone)]
pub struct EventBus {
    video_state_transitions: broadcast::Sender<VideoStateTransition>,
    media_events: broadcast::Sender<MediaEventEnvelope>,
    crf_search_events: broadcast::Sender<StageEvent>,
    encoding_events: broadcast::Sender<StageEvent>,
    analyzer_events: broadcast::Sender<StageEvent>,
}

/// [`MediaEvent`] wrapped for broadcast, since the variants themselves hold
/// non-`Clone`-cheap row types we still want fanned out by reference count.
#[derive(Clone)]
pub struct MediaEventEnvelope(pub std::sync::Arc<MediaEvent>);

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            video_state_transitions: broadcast::channel(CHANNEL_CAPACITY).0,
            media_events: broadcast::channel(CHANNEL_CAPACITY).0,
            crf_search_events: broadcast::channel(CHANNEL_CAPACITY).0,
            encoding_events: broadcast::channel(CHANNEL_CAPACITY).0,
            analyzer_events: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn publish_transition(&self, event: VideoStateTransition) {
        let _ = self.video_state_transitions.send(event);
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<VideoStateTransition> {
        self.video_state_transitions.subscribe()
    }

    pub fn publish_media(&self, event: MediaEvent) {
        let _ = self.media_events.send(MediaEventEnvelope(std::sync::Arc::new(event)));
    }

    pub fn subscribe_media(&self) -> broadcast::Receiver<MediaEventEnvelope> {
        self.media_events.subscribe()
    }

    pub fn publish_crf_search(&self, event: StageEvent) {
        let _ = self.crf_search_events.send(event);
    }

    pub fn subscribe_crf_search(&self) -> broadcast::Receiver<StageEvent> {
        self.crf_search_events.subscribe()
    }

    pub fn publish_encoding(&self, event: StageEvent) {
        let _ = self.encoding_events.send(event);
    }

    pub fn subscribe_encoding(&self) -> broadcast::Receiver<StageEvent> {
        self.encoding_events.subscribe()
    }

    pub fn publish_analyzer(&self, event: StageEvent) {
        let _ = self.analyzer_events.send(event);
    }

    pub fn subscribe_analyzer(&self) -> broadcast::Receiver<StageEvent> {
        self.analyzer_events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::VideoState;

    #[tokio::test]
    async fn transition_is_observed_by_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_transitions();
        bus.publish_transition(VideoStateTransition { video_id: 1, new_state: VideoState::Analyzed });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.video_id, 1);
        assert_eq!(received.new_state, VideoState::Analyzed);
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_events_published_before_it_joined() {
        let bus = EventBus::new();
        bus.publish_transition(VideoStateTransition { video_id: 1, new_state: VideoState::Analyzed });
        let mut rx = bus.subscribe_transitions();
        bus.publish_transition(VideoStateTransition { video_id: 2, new_state: VideoState::Failed });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.video_id, 2);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish_crf_search(StageEvent::completed(1, StageResult::Success));
    }
}
