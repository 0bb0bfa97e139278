//! Durable batch state, split into three artifacts under one directory:
//!
//! ```text
//! batches/
//!   active.json                         current batch, absent if none
//!   index.json                          summaries of archived batches
//!   <YYYYMMDD_HHMMSS>_<batch_id>.json   one archive per completed batch
//!   active.json.corrupted_<timestamp>   quarantined bad files
//! ```
//!
//! `active.json`, `index.json` and archives are all written through a temp file in
//! the same directory followed by a rename, so readers never see partial content.

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::batch::{BatchState, BatchStatus, FileStatus, FileUpdate};
use crate::BatchError;

pub(crate) mod atomic;
pub mod index;
mod migrate;

pub use index::IndexEntry;

const ACTIVE_FILE: &str = "active.json";
const INDEX_FILE: &str = "index.json";

/// Result of checking a batch against the filesystem
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileVerification {
    /// Sources that no longer exist on disk
    pub missing_sources: Vec<String>,
    /// Sources of completed files whose output is gone or was never recorded
    pub missing_outputs: Vec<String>,
}

impl FileVerification {
    pub fn is_clean(&self) -> bool {
        self.missing_sources.is_empty() && self.missing_outputs.is_empty()
    }
}

#[derive(Deserialize)]
struct ActiveId {
    batch_id: String,
}

/// Filesystem-backed store for the active batch, its archive and the index
pub struct BatchStore {
    root: PathBuf,
    // Serializes read-modify-write sequences on active.json and index.json
    lock: Mutex<()>,
}

impl BatchStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BatchError> {
        let root = root.into();
        fs_err::create_dir_all(&root)?;

        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    /// Open the store in the `batches` directory of an application data dir
    pub fn in_data_dir(data_dir: &Path) -> Result<Self, BatchError> {
        Self::new(data_dir.join("batches"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_path(&self) -> PathBuf {
        self.root.join(ACTIVE_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn has_active(&self) -> bool {
        self.active_path().exists()
    }

    /// Persist `state` as the active record, bumping `last_updated`
    pub fn save_active(&self, state: &mut BatchState) -> Result<(), BatchError> {
        let _guard = self.lock.lock();
        self.save_active_unlocked(state)
    }

    /// Load the active record.
    ///
    /// Returns `None` when there is no active batch. A record that fails to parse or
    /// validate is quarantined and also reported as `None`.
    pub fn load_active(&self) -> Option<BatchState> {
        let _guard = self.lock.lock();
        self.load_active_unlocked()
    }

    pub fn pause(&self, state: &mut BatchState) -> Result<(), BatchError> {
        state.status = BatchStatus::Paused;
        self.save_active(state)?;
        tracing::info!("Paused batch: {}", state.batch_id);
        Ok(())
    }

    /// Mark `state` completed, archive it, index it and drop the active record.
    ///
    /// The archive is written first; it remains the record of truth if the index
    /// update or the active-record removal fails afterwards.
    pub fn complete(&self, state: &mut BatchState) -> Result<(), BatchError> {
        let _guard = self.lock.lock();

        let now = Utc::now();
        state.status = BatchStatus::Completed;
        state.completed_at = Some(now);
        state.last_updated = now;

        let filename = archive_filename(state);
        atomic::write_json(&self.root, ".archive_", &self.root.join(&filename), &*state)?;
        tracing::info!("Archived batch {} to {}", state.batch_id, filename);

        let index_result = self.index_archive(state, &filename);

        let active_result = match self.peek_active_id() {
            Some(id) if id != state.batch_id => {
                tracing::warn!(
                    "Active record belongs to batch {}, leaving it in place",
                    id
                );
                Ok(())
            }
            _ => atomic::remove_if_exists(&self.active_path())
                .map(|_| ())
                .map_err(BatchError::from),
        };

        index_result.and(active_result)
    }

    /// Drop the active record without archiving it. Returns whether a record existed.
    pub fn dismiss_active(&self) -> Result<bool, BatchError> {
        let _guard = self.lock.lock();
        let removed = atomic::remove_if_exists(&self.active_path())?;
        if removed {
            tracing::info!("Dismissed active batch");
        }
        Ok(removed)
    }

    /// Find a batch by id, checking the active record before the archive
    pub fn load_by_id(&self, batch_id: &str) -> Option<BatchState> {
        let _guard = self.lock.lock();

        if let Some(active) = self.load_active_unlocked() {
            if active.batch_id == batch_id {
                return Some(active);
            }
        }

        let entries = index::load(&self.index_path());
        let entry = entries.iter().find(|e| e.batch_id == batch_id);
        let Some(entry) = entry else {
            tracing::warn!("Batch not found: {}", batch_id);
            return None;
        };

        match self.read_archive(&entry.filename) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!("Failed to load batch {}: {}", batch_id, e);
                None
            }
        }
    }

    /// Archived batch summaries, newest first, optionally filtered by status
    pub fn list(&self, status_filter: Option<BatchStatus>) -> Vec<IndexEntry> {
        let _guard = self.lock.lock();

        let mut entries: Vec<IndexEntry> = index::load(&self.index_path())
            .into_iter()
            .filter(|e| status_filter.map_or(true, |s| e.status == s))
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }

    /// Delete an archived batch and its index entry.
    ///
    /// Refuses to delete the batch that is currently active. Deleting an unknown
    /// id is a no-op and returns `Ok(false)`.
    pub fn delete(&self, batch_id: &str) -> Result<bool, BatchError> {
        let _guard = self.lock.lock();
        self.delete_unlocked(batch_id)
    }

    /// Delete completed batches whose completion is older than `days`.
    ///
    /// Entries without a completion time are never touched. Returns how many were deleted.
    pub fn cleanup_older_than(&self, days: u32) -> Result<usize, BatchError> {
        let _guard = self.lock.lock();

        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let expired: Vec<String> = index::load(&self.index_path())
            .into_iter()
            .filter(|e| e.status == BatchStatus::Completed)
            .filter(|e| e.completed_at.is_some_and(|t| t < cutoff))
            .map(|e| e.batch_id)
            .collect();

        let mut deleted = 0;
        for batch_id in expired {
            match self.delete_unlocked(&batch_id) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => tracing::error!("Failed to clean up batch {}: {}", batch_id, e),
            }
        }

        if deleted > 0 {
            tracing::info!("Cleaned up {} batches older than {} days", deleted, days);
        }
        Ok(deleted)
    }

    /// Check sources and completed outputs of `state` against the filesystem
    pub fn verify_files(&self, state: &BatchState) -> FileVerification {
        let mut result = FileVerification::default();

        for file in &state.files {
            if !Path::new(&file.source_path).exists() {
                tracing::warn!("Source file missing: {}", file.source_path);
                result.missing_sources.push(file.source_path.clone());
            }

            if file.status != FileStatus::Completed {
                continue;
            }

            match &file.output_path {
                Some(output) if Path::new(output).exists() => {}
                Some(output) => {
                    tracing::warn!("Output file missing: {}", output);
                    result.missing_outputs.push(file.source_path.clone());
                }
                None => {
                    tracing::warn!("Completed file has no output_path: {}", file.source_path);
                    result.missing_outputs.push(file.source_path.clone());
                }
            }
        }

        if !result.is_clean() {
            tracing::info!(
                "File verification: {} missing sources, {} missing outputs",
                result.missing_sources.len(),
                result.missing_outputs.len()
            );
        }
        result
    }

    /// Apply `update` to one file of the persisted active batch and save it.
    ///
    /// Fails hard when there is no active batch, when it is a different batch, or
    /// when the file is not part of it.
    pub fn update_file(
        &self,
        batch_id: &str,
        source_path: &str,
        update: FileUpdate,
    ) -> Result<BatchState, BatchError> {
        let _guard = self.lock.lock();

        let mut state = self.load_active_unlocked().ok_or(BatchError::NoActiveBatch)?;
        if state.batch_id != batch_id {
            return Err(BatchError::BatchMismatch {
                expected: batch_id.to_string(),
                found: state.batch_id,
            });
        }

        let index = state
            .index_of(source_path)
            .ok_or_else(|| BatchError::UnknownFile(source_path.to_string()))?;
        let old = state.apply_update(index, update)?;
        self.save_active_unlocked(&mut state)?;

        tracing::debug!(
            "Updated file {}: {} -> {}",
            source_path,
            old,
            state.files[index].status
        );
        Ok(state)
    }

    fn save_active_unlocked(&self, state: &mut BatchState) -> Result<(), BatchError> {
        state.last_updated = Utc::now();
        atomic::write_json(&self.root, ".active_", &self.active_path(), &*state)?;
        tracing::debug!("Saved active batch: {}", state.batch_id);
        Ok(())
    }

    fn load_active_unlocked(&self) -> Option<BatchState> {
        let path = self.active_path();
        if !path.exists() {
            tracing::debug!("No active batch file found");
            return None;
        }

        // Bytes, not a string: undecodable content is a parse error and gets quarantined
        let content = match fs_err::read(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!("Failed to read active batch file: {}", e);
                return None;
            }
        };

        match parse_state(&content) {
            Ok(state) => {
                tracing::info!(
                    "Loaded active batch: {} with {} files",
                    state.batch_id,
                    state.files.len()
                );
                Some(state)
            }
            Err(e) => {
                tracing::error!("Invalid active batch file: {}", e);
                atomic::quarantine(&path);
                None
            }
        }
    }

    fn peek_active_id(&self) -> Option<String> {
        let content = fs_err::read(self.active_path()).ok()?;
        serde_json::from_slice::<ActiveId>(&content)
            .ok()
            .map(|a| a.batch_id)
    }

    fn read_archive(&self, filename: &str) -> Result<BatchState, BatchError> {
        let content = fs_err::read(self.root.join(filename))?;
        parse_state(&content)
    }

    fn index_archive(&self, state: &BatchState, filename: &str) -> Result<(), BatchError> {
        let mut entries = index::load(&self.index_path());
        let replaced = index::upsert(&mut entries, IndexEntry::from_state(state, filename));
        index::save(&self.root, &self.index_path(), &entries)?;

        // A re-completed batch keeps a single archive file
        if let Some(old) = replaced.filter(|old| old.filename != filename) {
            if let Err(e) = atomic::remove_if_exists(&self.root.join(&old.filename)) {
                tracing::warn!("Failed to remove superseded archive {}: {}", old.filename, e);
            }
        }
        Ok(())
    }

    fn delete_unlocked(&self, batch_id: &str) -> Result<bool, BatchError> {
        if self.peek_active_id().as_deref() == Some(batch_id) {
            return Err(BatchError::ActiveBatchInUse(batch_id.to_string()));
        }

        let mut entries = index::load(&self.index_path());
        let Some(position) = entries.iter().position(|e| e.batch_id == batch_id) else {
            tracing::warn!("Batch not found in index: {}", batch_id);
            return Ok(false);
        };
        let entry = entries.remove(position);

        match atomic::remove_if_exists(&self.root.join(&entry.filename)) {
            Ok(true) => tracing::info!("Deleted batch file: {}", entry.filename),
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to delete batch file {}: {}", entry.filename, e),
        }

        index::save(&self.root, &self.index_path(), &entries)?;
        tracing::info!("Deleted batch from index: {}", batch_id);
        Ok(true)
    }
}

/// Archive file name: completion time to the second, then the batch id
pub fn archive_filename(state: &BatchState) -> String {
    let completed = state.completed_at.unwrap_or(state.last_updated);
    format!("{}_{}.json", completed.format("%Y%m%d_%H%M%S"), state.batch_id)
}

fn parse_state(content: &[u8]) -> Result<BatchState, BatchError> {
    let state: BatchState = serde_json::from_slice(content)?;
    state.validate()?;
    Ok(state)
}
