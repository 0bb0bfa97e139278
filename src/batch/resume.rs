//! Picking an interrupted batch back up at startup.

use std::collections::HashSet;

use super::{BatchState, BatchStatus, FileStatus, FileUpdate};
use crate::store::BatchStore;
use crate::BatchError;

const MISSING_SOURCE_MESSAGE: &str = "Source file no longer exists";

/// What [`prepare_resume`] found
#[derive(Debug)]
pub enum ResumeOutcome {
    /// No active batch
    Nothing,
    /// Every file had already reached a final status; the batch was archived
    Finished(BatchState),
    /// Work remains
    Ready(ResumePlan),
}

/// A repaired batch ready to hand to the orchestrator
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub state: BatchState,
    /// Sources that are gone from disk; the caller decides what to do with them
    pub missing_sources: Vec<String>,
    /// Completed files whose output was missing, now pending again
    pub requeued_outputs: Vec<String>,
    /// Files interrupted mid-stage or skipped by a cancellation, now pending again
    pub requeued_interrupted: Vec<String>,
}

impl ResumePlan {
    /// Mark every missing source as skipped. Returns how many were changed.
    pub fn skip_missing_sources(&mut self) -> usize {
        let mut skipped = 0;
        for source in &self.missing_sources {
            let Some(index) = self.state.index_of(source) else {
                continue;
            };
            if self.state.files[index].status == FileStatus::Skipped {
                continue;
            }
            if self
                .state
                .apply_update(index, FileUpdate::Skipped(MISSING_SOURCE_MESSAGE.to_string()))
                .is_ok()
            {
                tracing::info!("Skipping missing source: {}", source);
                skipped += 1;
            }
        }
        skipped
    }

    /// Files the orchestrator will pick up: pending ones plus failures
    pub fn remaining(&self) -> usize {
        self.state.count_with_status(FileStatus::Pending) + self.state.count_with_status(FileStatus::Failed)
    }
}

/// Load the active batch and repair it for another run.
///
/// Completed files whose output disappeared are reset to pending, as are files a
/// crash caught mid-stage and files a cancellation skipped. Failed files are left
/// for the retry phase. Missing sources are only reported.
pub fn prepare_resume(store: &BatchStore) -> Result<ResumeOutcome, BatchError> {
    let Some(mut state) = store.load_active() else {
        return Ok(ResumeOutcome::Nothing);
    };

    if state.incomplete_count() == 0 {
        tracing::info!(
            "Batch {} has no incomplete files, archiving it",
            state.batch_id
        );
        store.complete(&mut state)?;
        return Ok(ResumeOutcome::Finished(state));
    }

    let verification = store.verify_files(&state);
    let missing: HashSet<&str> = verification
        .missing_sources
        .iter()
        .map(String::as_str)
        .collect();

    let mut requeued_outputs = Vec::new();
    for source in &verification.missing_outputs {
        if let Some(index) = state.index_of(source) {
            state.apply_update(index, FileUpdate::Pending)?;
            requeued_outputs.push(source.clone());
        }
    }

    let mut requeued_interrupted = Vec::new();
    for index in 0..state.files.len() {
        let file = &state.files[index];
        let interrupted = file.status.is_in_flight()
            || (file.status == FileStatus::Skipped && !missing.contains(file.source_path.as_str()));
        if interrupted {
            requeued_interrupted.push(file.source_path.clone());
            state.apply_update(index, FileUpdate::Pending)?;
        }
    }

    state.status = BatchStatus::Active;
    tracing::info!(
        "Resuming batch {}: {} outputs re-queued, {} interrupted files re-queued, {} sources missing",
        state.batch_id,
        requeued_outputs.len(),
        requeued_interrupted.len(),
        verification.missing_sources.len()
    );

    Ok(ResumeOutcome::Ready(ResumePlan {
        state,
        missing_sources: verification.missing_sources,
        requeued_outputs,
        requeued_interrupted,
    }))
}
