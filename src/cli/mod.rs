use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::batch::{BatchStatus, OutputFormat};

pub mod commands;
pub mod progress;

#[derive(Parser, Debug)]
#[command(
    name = "batchscribe",
    about = "Batch transcription that survives crashes and picks up where it left off",
    version,
    long_about = "Runs many media files through convert -> transcribe -> save with a pool of workers. \
                  Progress is saved continuously, so an interrupted batch can be resumed, \
                  and finished batches are kept in a browsable history."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, env = "BATCHSCRIBE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Data directory, overriding storage.data_dir
    #[arg(long, global = true, env = "BATCHSCRIBE_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new batch over the given media files
    Run {
        /// Audio or video files to transcribe
        #[arg(value_name = "FILES", required = true)]
        files: Vec<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Directory for transcripts (defaults to next to each source)
        #[arg(short, long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Language code for transcription
        #[arg(short, long, value_name = "LANG")]
        language: Option<String>,

        /// Enable speaker diarization
        #[arg(long)]
        diarize: bool,

        /// Disable smart formatting
        #[arg(long)]
        no_smart_format: bool,

        /// Number of files processed at once
        #[arg(short, long, value_name = "COUNT")]
        workers: Option<usize>,

        /// Drop an unfinished batch instead of refusing to start
        #[arg(long)]
        discard_active: bool,
    },

    /// Continue the unfinished batch
    Resume {
        /// Keep files whose source disappeared queued instead of skipping them
        #[arg(long)]
        keep_missing: bool,
    },

    /// Re-run the failed files of the active batch, or of an archived one
    Retry {
        /// Batch to retry (defaults to the active batch)
        #[arg(value_name = "BATCH_ID")]
        batch_id: Option<String>,
    },

    /// Show the unfinished batch
    Status,

    /// Mark one file of the unfinished batch as skipped
    Skip {
        /// Source path as recorded in the batch
        #[arg(value_name = "SOURCE")]
        source: String,
    },

    /// Drop the unfinished batch without archiving it
    Dismiss,

    /// Browse and manage archived batches
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },

    /// Show or create the configuration file
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommand {
    /// List archived batches, newest first
    List {
        /// Only show batches with this status
        #[arg(long, value_enum)]
        status: Option<BatchStatus>,
    },

    /// Show one batch with its files
    Show {
        #[arg(value_name = "BATCH_ID")]
        batch_id: String,
    },

    /// Delete an archived batch
    Delete {
        #[arg(value_name = "BATCH_ID")]
        batch_id: String,
    },

    /// Delete completed batches older than the retention period
    Cleanup {
        /// Age in days (defaults to history.retention_days)
        #[arg(long, value_name = "DAYS")]
        days: Option<u32>,
    },
}
