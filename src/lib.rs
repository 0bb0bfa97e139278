//! Batchscribe - resumable batch transcription with crash-safe state persistence
//!
//! This library runs a fixed convert -> transcribe -> save pipeline over a batch of
//! media files with a bounded worker pool, persists batch progress through a throttled
//! background writer, and resumes interrupted batches after a crash.

pub mod batch;
pub mod classify;
pub mod cli;
pub mod config;
pub mod pipeline;
pub mod store;
pub mod utils;
pub mod writer;

pub use batch::{
    BatchSettings, BatchState, BatchStatistics, BatchStatus, FileState, FileStatus, FileUpdate,
    OutputFormat,
};
pub use classify::ErrorCategory;
pub use config::AppConfig;
pub use pipeline::orchestrator::{Orchestrator, RunReport};
pub use store::BatchStore;
pub use writer::BatchWriter;

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Errors raised by the batch store and the state model
#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("Batch {0} is the active batch. Finish or dismiss it first.")]
    ActiveBatchInUse(String),

    #[error("Batch ID mismatch: expected {expected}, got {found}")]
    BatchMismatch { expected: String, found: String },

    #[error("No active batch")]
    NoActiveBatch,

    #[error("File not found in batch: {0}")]
    UnknownFile(String),

    #[error("Invalid batch state: {0}")]
    InvalidState(String),

    #[error("Batch store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Batch serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl BatchError {
    /// Usage errors the caller must fix, as opposed to environmental failures
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BatchError::ActiveBatchInUse(_)
                | BatchError::BatchMismatch { .. }
                | BatchError::NoActiveBatch
                | BatchError::UnknownFile(_)
        )
    }
}
