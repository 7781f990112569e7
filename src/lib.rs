//! Reencodarr - an automated AV1 re-encoding orchestrator.
//!
//! Analyzes a media library with `mediainfo`, searches for the lowest CRF
//! that still meets a target VMAF score with `ab-av1 crf-search`, and
//! re-encodes with `ab-av1 encode`, swapping the result into place.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod orphan;
pub mod parser;
pub mod post_process;
pub mod process;
pub mod producer;
pub mod rules;
pub mod store;
pub mod validation;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands, StageArg};
use crate::config::model::AppConfig;
use crate::config::ConfigManager;
use crate::post_process::FilesystemOutputSink;
use crate::producer::{AnalyzerQueries, CrfSearchQueries, EncoderQueries};
use crate::store::queries;
use crate::validation::SystemCapabilities;
use crate::workers::crf_search::CrfSearchWorker;
use crate::workers::encoder::{EncoderController, PortHolderRegistry};

/// Runs the orchestrator with the provided CLI arguments.
pub async fn run(cli: Cli) -> Result<()> {
    setup_logging(cli.log_level())?;

    match cli.command {
        Commands::Run { dry_run } => run_orchestrator(&cli.config, dry_run).await,
        Commands::ConfigValidate => validate_config(&cli.config).await,
        Commands::ConfigShow => show_config(&cli.config).await,
        Commands::QueueStatus => queue_status(&cli.config).await,
        Commands::Pause { stage } => set_pause(&cli.config, stage, true).await,
        Commands::Resume { stage } => set_pause(&cli.config, stage, false).await,
        Commands::ForceReanalyze { video_id } => force_reanalyze(&cli.config, video_id).await,
        Commands::ResetWorker { stage } => reset_worker(&cli.config, stage).await,
    }
}

fn setup_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt().with_env_filter(filter).json().with_target(true).with_file(true).with_line_number(true).init();

    Ok(())
}

fn stage_name(stage: StageArg) -> &'static str {
    match stage {
        StageArg::Analyzer => "analyzer",
        StageArg::CrfSearch => "crf_search",
        StageArg::Encoder => "encoder",
    }
}

async fn load_config(config_path: &std::path::Path) -> Result<(AppConfig, SystemCapabilities)> {
    // Capabilities are probed before validation so the config report can
    // downgrade a missing tool to a warning rather than a hard error.
    let probe_tools = config::loader::load_from_path(config_path).map(|c| c.global.tools).unwrap_or_default();
    let capabilities = SystemCapabilities::detect(&probe_tools);
    let config = config::loader::load_and_validate(config_path, &capabilities)?;
    Ok((config, capabilities))
}

/// Starts the orchestrator: orphan reaper, event bus, the three producers,
/// and their downstream workers, until Ctrl+C.
async fn run_orchestrator(config_path: &std::path::Path, dry_run: bool) -> Result<()> {
    info!("Starting reencodarr");

    let (config, capabilities) = load_config(config_path).await?;
    info!(?capabilities, "Detected system capabilities");

    let config_manager = ConfigManager::new(config_path, &capabilities).await?;
    let config_handle = config_manager.get_config();

    let pool = store::connect(&config.global.database.path).await?;
    info!(path = ?config.global.database.path, "Connected to video store");

    orphan::reap(&pool, &config.global.retry).await;
    info!("Orphan reaper completed");

    let event_bus = events::EventBus::new();
    let poll_interval = Duration::from_secs(config.global.producer_poll_interval_seconds);
    let retry = config.global.retry.clone();

    let (analyzer_producer, mut analyzer_rx) =
        producer::spawn(Box::new(AnalyzerQueries), pool.clone(), event_bus.clone(), poll_interval, retry.clone());
    let (crf_producer, mut crf_rx) =
        producer::spawn(Box::new(CrfSearchQueries), pool.clone(), event_bus.clone(), poll_interval, retry.clone());
    let (encoder_producer, mut encoder_rx) =
        producer::spawn(Box::new(EncoderQueries), pool.clone(), event_bus.clone(), poll_interval, retry.clone());

    // Analyzer: batches are dispatched straight through, no single-slot limit.
    {
        let pool = pool.clone();
        let event_bus = event_bus.clone();
        let config_handle = config_handle.clone();
        let producer = analyzer_producer.clone();
        tokio::spawn(async move {
            while let Some(batch) = analyzer_rx.recv().await {
                let (tools, max_chunk_concurrency, retry, batch_size) = {
                    let config = config_handle.read().await;
                    (
                        config.global.tools.clone(),
                        config.global.analyzer.max_chunk_concurrency,
                        config.global.retry.clone(),
                        config.global.analyzer.batch_size as i64,
                    )
                };
                workers::analyzer::run_batch(&pool, &event_bus, &tools, &retry, batch, max_chunk_concurrency).await;
                producer.notify_batch_complete().await;
                producer.request_demand(batch_size).await;
            }
        });
    }
    {
        let batch_size = config_handle.read().await.global.analyzer.batch_size as i64;
        analyzer_producer.request_demand(batch_size).await;
    }

    // CRF-search: single-slot worker, one Video at a time.
    {
        let pool = pool.clone();
        let event_bus = event_bus.clone();
        let config_handle = config_handle.clone();
        let producer = crf_producer.clone();
        let worker = Arc::new(CrfSearchWorker::new());
        tokio::spawn(async move {
            while let Some(mut batch) = crf_rx.recv().await {
                if let Some(video) = batch.pop() {
                    let (tools, quality, retry, temp_dir) = {
                        let config = config_handle.read().await;
                        (
                            config.global.tools.clone(),
                            config.global.quality.clone(),
                            config.global.retry.clone(),
                            config.global.temp_dir.clone(),
                        )
                    };
                    worker.try_run(&pool, &event_bus, &tools, &quality, &retry, &temp_dir, video).await;
                }
                producer.notify_batch_complete().await;
                producer.request_demand(1).await;
            }
        });
    }
    crf_producer.request_demand(1).await;

    // Encoder: single Video at a time, using whichever chosen Vmaf it came with.
    // `registry` keeps a spawned encode's Port-Holder alive across a panicking
    // Controller task; each dispatch runs in its own tokio task so a panic in
    // `EncoderController::run` surfaces as a `JoinError` instead of taking the
    // whole encoder loop down.
    {
        let pool = pool.clone();
        let event_bus = event_bus.clone();
        let config_handle = config_handle.clone();
        let producer = encoder_producer.clone();
        let sink: Arc<dyn post_process::OutputSink> = Arc::new(FilesystemOutputSink);
        let registry: PortHolderRegistry = Arc::new(tokio::sync::Mutex::new(std::collections::HashMap::new()));
        tokio::spawn(async move {
            while let Some(mut batch) = encoder_rx.recv().await {
                if let Some(video) = batch.pop() {
                    match queries::vmafs_for_video(&pool, video.id).await {
                        Ok(vmafs) => {
                            if let Some(vmaf) = vmafs.into_iter().find(|v| v.chosen) {
                                let (tools, progress, retry, temp_dir) = {
                                    let config = config_handle.read().await;
                                    (
                                        config.global.tools.clone(),
                                        config.global.progress.clone(),
                                        config.global.retry.clone(),
                                        config.global.temp_dir.clone(),
                                    )
                                };
                                if dry_run {
                                    info!(video_id = video.id, "dry-run: skipping encode");
                                } else {
                                    let pool = pool.clone();
                                    let event_bus = event_bus.clone();
                                    let sink = sink.clone();
                                    let registry = registry.clone();
                                    let video_id = video.id;
                                    let handle = tokio::spawn(async move {
                                        EncoderController::run(
                                            &pool,
                                            &event_bus,
                                            &tools,
                                            &progress,
                                            &retry,
                                            &temp_dir,
                                            &registry,
                                            sink.as_ref(),
                                            video,
                                            vmaf,
                                        )
                                        .await;
                                    });
                                    if let Err(e) = handle.await {
                                        warn!(video_id, error = %e, "encoder controller task panicked");
                                    }
                                }
                            } else {
                                warn!(video_id = video.id, "encoder dispatched a video with no chosen vmaf");
                            }
                        }
                        Err(e) => warn!(video_id = video.id, error = %e, "failed to load chosen vmaf"),
                    }
                }
                producer.notify_batch_complete().await;
                producer.request_demand(1).await;
            }
        });
    }
    encoder_producer.request_demand(1).await;

    info!("Reencodarr is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}

async fn validate_config(config_path: &std::path::Path) -> Result<()> {
    let config = config::loader::load_from_path(config_path)?;
    let capabilities = SystemCapabilities::detect(&config.global.tools);
    let result = validation::validate_config(&config, &capabilities);

    println!("{}", validation::report::format_report(&result));

    if !result.is_valid() {
        anyhow::bail!("configuration rejected");
    }

    println!("{} librar{} configured:", config.libraries.len(), if config.libraries.len() == 1 { "y" } else { "ies" });
    for library in &config.libraries {
        println!("  - {}", library.path.display());
    }
    Ok(())
}

async fn show_config(config_path: &std::path::Path) -> Result<()> {
    let (config, _) = load_config(config_path).await?;
    let yaml = serde_yaml::to_string(&config)?;
    println!("{}", yaml);
    Ok(())
}

async fn queue_status(config_path: &std::path::Path) -> Result<()> {
    let (config, _) = load_config(config_path).await?;
    let pool = store::connect(&config.global.database.path).await?;
    let stats = queries::get_dashboard_stats(&pool).await?;

    println!("needs_analysis  {}", stats.needs_analysis);
    println!("analyzed        {}", stats.analyzed);
    println!("crf_searching   {}", stats.crf_searching);
    println!("crf_searched    {}", stats.crf_searched);
    println!("encoding        {}", stats.encoding);
    println!("encoded         {}", stats.encoded);
    println!("failed          {}", stats.failed);
    println!("total size      {} bytes", stats.total_size_bytes);
    println!("vmaf samples    {}", stats.vmaf_count);
    println!("total savings   {} bytes", stats.total_savings_bytes);

    Ok(())
}

async fn set_pause(config_path: &std::path::Path, stage: StageArg, paused: bool) -> Result<()> {
    let (config, _) = load_config(config_path).await?;
    let pool = store::connect(&config.global.database.path).await?;
    queries::set_stage_paused(&pool, stage_name(stage), paused).await?;
    println!("{} {}", stage_name(stage), if paused { "paused" } else { "resumed" });
    Ok(())
}

async fn force_reanalyze(config_path: &std::path::Path, video_id: i64) -> Result<()> {
    let (config, _) = load_config(config_path).await?;
    let pool = store::connect(&config.global.database.path).await?;
    let video = queries::force_reanalyze(&pool, video_id).await?;
    queries::enqueue_manual(&pool, "analyzer", video.id).await?;
    println!("video {} reset to {}", video.id, video.state);
    Ok(())
}

async fn reset_worker(config_path: &std::path::Path, stage: StageArg) -> Result<()> {
    let (config, _) = load_config(config_path).await?;
    let pool = store::connect(&config.global.database.path).await?;

    match stage {
        StageArg::CrfSearch => {
            process::runner::kill_orphans_matching(process::reaper::CRF_SEARCH_PREFIX);
            orphan::reset_orphaned_crf_searching(&pool, &config.global.retry).await;
        }
        StageArg::Encoder => {
            process::runner::kill_orphans_matching(process::reaper::ENCODE_PREFIX);
            orphan::reset_orphaned_encoding(&pool, &config.global.retry).await;
        }
        StageArg::Analyzer => {
            error!("reset-worker is not meaningful for the analyzer: mediainfo invocations are not single-slot");
            anyhow::bail!("analyzer has no single in-flight worker to reset");
        }
    }

    println!("{} worker reset", stage_name(stage));
    Ok(())
}
