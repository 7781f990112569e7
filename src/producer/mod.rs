//! Per-stage demand-driven source: pulls eligible Videos from the store and
//! hands them to a stage worker, honoring pause/resume and backpressure.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::warn;

use crate::config::model::RetryConfig;
use crate::error::StoreError;
use crate::events::{EventBus, MediaEventEnvelope, VideoStateTransition};
use crate::store::models::Video;
use crate::store::{queries, with_busy_retry};

/// Where a [`Producer`] pulls its next eligible batch from.
#[async_trait]
pub trait StageQueries: Send + Sync {
    async fn fetch_eligible(&self, pool: &SqlitePool, limit: i64) -> Result<Vec<Video>, StoreError>;
    fn name(&self) -> &'static str;
}

pub struct AnalyzerQueries;
#[async_trait]
impl StageQueries for AnalyzerQueries {
    async fn fetch_eligible(&self, pool: &SqlitePool, limit: i64) -> Result<Vec<Video>, StoreError> {
        queries::videos_needing_analysis(pool, limit).await
    }
    fn name(&self) -> &'static str {
        "analyzer"
    }
}

pub struct CrfSearchQueries;
#[async_trait]
impl StageQueries for CrfSearchQueries {
    async fn fetch_eligible(&self, pool: &SqlitePool, limit: i64) -> Result<Vec<Video>, StoreError> {
        queries::videos_for_crf_search(pool, limit).await
    }
    fn name(&self) -> &'static str {
        "crf_search"
    }
}

pub struct EncoderQueries;
#[async_trait]
impl StageQueries for EncoderQueries {
    async fn fetch_eligible(&self, pool: &SqlitePool, limit: i64) -> Result<Vec<Video>, StoreError> {
        queries::videos_for_encoding(pool, limit).await
    }
    fn name(&self) -> &'static str {
        "encoder"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerStatus {
    Paused,
    Running,
    Processing,
    Pausing,
    Idle,
}

struct ProducerInner {
    status: ProducerStatus,
    demand: i64,
}

/// A single stage's demand-driven feed. One instance per stage (analyzer,
/// CRF-search, encoder); the downstream worker is just whatever reads
/// `dispatch_rx`.
pub struct Producer {
    queries: Box<dyn StageQueries>,
    pool: SqlitePool,
    event_bus: EventBus,
    dispatch_tx: mpsc::Sender<Vec<Video>>,
    inner: Mutex<ProducerInner>,
    poll_interval: Duration,
    retry: RetryConfig,
}

impl Producer {
    pub fn new(
        queries: Box<dyn StageQueries>,
        pool: SqlitePool,
        event_bus: EventBus,
        poll_interval: Duration,
        retry: RetryConfig,
    ) -> (Self, mpsc::Receiver<Vec<Video>>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(4);
        let producer = Self {
            queries,
            pool,
            event_bus,
            dispatch_tx,
            inner: Mutex::new(ProducerInner { status: ProducerStatus::Running, demand: 0 }),
            poll_interval,
            retry,
        };
        (producer, dispatch_rx)
    }

    pub async fn status(&self) -> ProducerStatus {
        self.inner.lock().await.status
    }

    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        inner.status = match inner.status {
            ProducerStatus::Processing => ProducerStatus::Pausing,
            _ => ProducerStatus::Paused,
        };
    }

    pub async fn resume(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.status = ProducerStatus::Running;
        }
        self.notify_wakeup().await;
    }

    /// Called by the downstream worker to request up to `n` more items.
    pub async fn request_demand(&self, n: i64) {
        {
            let mut inner = self.inner.lock().await;
            inner.demand += n;
        }
        self.dispatch(false).await;
    }

    /// Enqueues `video_id` onto the manual override queue (operator-triggered
    /// re-analysis jumps the normal database order). Durable: written to the
    /// same `manual_queue` table `force-reanalyze` writes to from a separate
    /// CLI process, so either reaches a running producer.
    pub async fn force_enqueue(&self, video_id: i64) {
        if let Err(e) = queries::enqueue_manual(&self.pool, self.queries.name(), video_id).await {
            warn!(stage = self.queries.name(), video_id, error = %e, "failed to enqueue manual dispatch");
            return;
        }
        self.notify_wakeup().await;
    }

    /// Called by the downstream worker when a dispatched batch finishes
    /// processing, so a pending pause can complete and status settles back
    /// to `running`/`paused` correctly.
    pub async fn notify_batch_complete(&self) {
        let mut inner = self.inner.lock().await;
        inner.status = match inner.status {
            ProducerStatus::Pausing => ProducerStatus::Paused,
            ProducerStatus::Processing => ProducerStatus::Running,
            other => other,
        };
    }

    /// Any state transition or media event may create new eligibility; force
    /// a one-item dispatch even at zero demand so the worker advances out of
    /// an idle wait.
    pub async fn notify_wakeup(&self) {
        self.dispatch(true).await;
    }

    pub async fn poll_tick(&self) {
        self.dispatch(false).await;
    }

    async fn dispatch(&self, force_if_idle: bool) {
        let operator_paused = self
            .with_retry(|| queries::is_stage_paused(&self.pool, self.queries.name()))
            .await
            .unwrap_or(false);

        let effective_demand = {
            let mut inner = self.inner.lock().await;

            if operator_paused {
                if inner.status != ProducerStatus::Processing {
                    inner.status = ProducerStatus::Paused;
                }
                return;
            } else if inner.status == ProducerStatus::Paused {
                inner.status = ProducerStatus::Running;
            }

            if !matches!(inner.status, ProducerStatus::Running | ProducerStatus::Processing | ProducerStatus::Idle) {
                return;
            }

            let mut demand = inner.demand;
            if demand == 0 && force_if_idle {
                demand = 1;
            }
            if demand == 0 {
                return;
            }
            demand
        };

        let manual_ids = self
            .with_retry(|| queries::pop_manual(&self.pool, self.queries.name(), effective_demand))
            .await
            .unwrap_or_default();

        let mut batch = Vec::new();
        for id in manual_ids {
            match self.with_retry(|| queries::get_video(&self.pool, id)).await {
                Ok(video) => batch.push(video),
                Err(e) => warn!(stage = self.queries.name(), video_id = id, error = %e, "manual-queue video missing"),
            }
        }

        let remaining = effective_demand - batch.len() as i64;
        if remaining > 0 {
            match self.with_retry(|| self.queries.fetch_eligible(&self.pool, remaining)).await {
                Ok(mut videos) => batch.append(&mut videos),
                Err(e) => warn!(stage = self.queries.name(), error = %e, "store query failed during dispatch"),
            }
        }

        if batch.is_empty() {
            let mut inner = self.inner.lock().await;
            if inner.status == ProducerStatus::Running {
                inner.status = ProducerStatus::Idle;
            }
            return;
        }

        let dispatched = batch.len() as i64;
        if self.dispatch_tx.send(batch).await.is_err() {
            warn!(stage = self.queries.name(), "downstream worker channel closed");
            return;
        }

        let mut inner = self.inner.lock().await;
        inner.demand = (inner.demand - dispatched).max(0);
        inner.status = ProducerStatus::Processing;
    }

    /// Drives the producer: wakes on event-bus transitions, media events,
    /// and a low-frequency poll fallback.
    pub async fn run(
        &self,
        mut transitions_rx: broadcast::Receiver<VideoStateTransition>,
        mut media_rx: broadcast::Receiver<MediaEventEnvelope>,
    ) {
        let mut poll = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = poll.tick() => self.poll_tick().await,
                result = transitions_rx.recv() => {
                    if result.is_ok() {
                        self.notify_wakeup().await;
                    }
                }
                result = media_rx.recv() => {
                    if result.is_ok() {
                        self.notify_wakeup().await;
                    }
                }
            }
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    async fn with_retry<T, F, Fut>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        with_busy_retry(self.retry.db_busy_max_attempts, self.retry.db_busy_base_delay_ms, f).await
    }
}

/// Convenience to spin up a `Producer` plus its background `run` task.
pub fn spawn(
    queries: Box<dyn StageQueries>,
    pool: SqlitePool,
    event_bus: EventBus,
    poll_interval: Duration,
    retry: RetryConfig,
) -> (std::sync::Arc<Producer>, mpsc::Receiver<Vec<Video>>) {
    let transitions_rx = event_bus.subscribe_transitions();
    let media_rx = event_bus.subscribe_media();
    let (producer, dispatch_rx) = Producer::new(queries, pool, event_bus, poll_interval, retry);
    let producer = std::sync::Arc::new(producer);
    let task_producer = producer.clone();
    tokio::spawn(async move {
        task_producer.run(transitions_rx, media_rx).await;
    });
    (producer, dispatch_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::VideoState;

    struct EmptyQueries;
    #[async_trait]
    impl StageQueries for EmptyQueries {
        async fn fetch_eligible(&self, _pool: &SqlitePool, _limit: i64) -> Result<Vec<Video>, StoreError> {
            Ok(vec![])
        }
        fn name(&self) -> &'static str {
            "empty"
        }
    }

    fn event_bus() -> EventBus {
        EventBus::new()
    }

    #[test]
    fn pause_from_processing_goes_to_pausing_not_paused() {
        let mut inner = ProducerInner { status: ProducerStatus::Processing, demand: 0 };
        inner.status = match inner.status {
            ProducerStatus::Processing => ProducerStatus::Pausing,
            _ => ProducerStatus::Paused,
        };
        assert_eq!(inner.status, ProducerStatus::Pausing);
    }

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

    #[tokio::test]
    async fn dispatch_with_zero_demand_does_nothing() {
        let pool = memory_pool().await;
        insert_video(&pool, "/a.mkv", VideoState::NeedsAnalysis).await;
        let (producer, mut rx) = Producer::new(
            Box::new(AnalyzerQueries),
            pool,
            event_bus(),
            Duration::from_secs(60),
            RetryConfig::default(),
        );
        producer.poll_tick().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn demand_pulls_eligible_videos() {
        let pool = memory_pool().await;
        insert_video(&pool, "/a.mkv", VideoState::NeedsAnalysis).await;
        insert_video(&pool, "/b.mkv", VideoState::NeedsAnalysis).await;
        let (producer, mut rx) = Producer::new(
            Box::new(AnalyzerQueries),
            pool,
            event_bus(),
            Duration::from_secs(60),
            RetryConfig::default(),
        );
        producer.request_demand(1).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn manual_queue_is_served_before_store_query() {
        let pool = memory_pool().await;
        insert_video(&pool, "/a.mkv", VideoState::NeedsAnalysis).await;
        let forced_id = insert_video(&pool, "/forced.mkv", VideoState::NeedsAnalysis).await;
        let (producer, mut rx) = Producer::new(
            Box::new(AnalyzerQueries),
            pool,
            event_bus(),
            Duration::from_secs(60),
            RetryConfig::default(),
        );
        producer.force_enqueue(forced_id).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].id, forced_id);
    }
}
