//! Command-line interface definitions.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// An automated AV1 re-encoding orchestrator: analyze, CRF-search, encode.
#[derive(Parser, Debug)]
#[command(name = "reencodarr", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/config/reencodarr.yaml", env = "CONFIG_PATH", global = true)]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// A pipeline stage an operator can pause, resume, or reset.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageArg {
    Analyzer,
    CrfSearch,
    Encoder,
}

/// Available subcommands for the pipeline.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the orchestrator: producers, workers, and the orphan reaper.
    Run {
        /// Run without performing any destructive filesystem hand-off (the
        /// encoder still runs to completion, but the swap-into-place step
        /// is skipped).
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },

    /// Validate the configuration file without starting.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the parsed configuration.
    #[command(name = "config-show")]
    ConfigShow,

    /// Print dashboard-style aggregate stats (queue depths, totals, savings).
    #[command(name = "queue-status")]
    QueueStatus,

    /// Pause a stage's producer; in-flight work finishes, no new work starts.
    Pause {
        #[arg(long, value_enum)]
        stage: StageArg,
    },

    /// Resume a paused stage's producer.
    Resume {
        #[arg(long, value_enum)]
        stage: StageArg,
    },

    /// Force a Video back to `needs_analysis` regardless of its current state.
    #[command(name = "force-reanalyze")]
    ForceReanalyze {
        /// The Video id to re-queue.
        video_id: i64,
    },

    /// Kill a stage's in-flight process and reset its Video to the prior
    /// stable state, as if the process had crashed.
    #[command(name = "reset-worker")]
    ResetWorker {
        #[arg(long, value_enum)]
        stage: StageArg,
    },
}
