use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::atomic;
use crate::batch::{BatchState, BatchStatus};
use crate::BatchError;

/// Lightweight summary of an archived batch, one per entry in `index.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub batch_id: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_files: usize,
    pub completed_files: usize,
    /// Archive file name inside the batches directory
    pub filename: String,
}

impl IndexEntry {
    pub fn from_state(state: &BatchState, filename: impl Into<String>) -> Self {
        Self {
            batch_id: state.batch_id.clone(),
            status: state.status,
            created_at: state.created_at,
            completed_at: state.completed_at,
            total_files: state.statistics.total_files,
            completed_files: state.statistics.completed,
            filename: filename.into(),
        }
    }
}

/// Read the index. A missing file is an empty index; a corrupted one is quarantined.
pub(super) fn load(path: &Path) -> Vec<IndexEntry> {
    if !path.exists() {
        return Vec::new();
    }

    let content = match fs_err::read(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::error!("Failed to read index file: {}", e);
            return Vec::new();
        }
    };

    match serde_json::from_slice(&content) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("Corrupted index file: {}", e);
            atomic::quarantine(path);
            Vec::new()
        }
    }
}

pub(super) fn save(dir: &Path, path: &Path, entries: &[IndexEntry]) -> Result<(), BatchError> {
    atomic::write_json(dir, ".index_", path, &entries)?;
    tracing::debug!("Saved index with {} entries", entries.len());
    Ok(())
}

/// Insert `entry`, replacing any entry with the same batch id.
///
/// Returns the entry that was replaced, if any.
pub(super) fn upsert(entries: &mut Vec<IndexEntry>, entry: IndexEntry) -> Option<IndexEntry> {
    match entries.iter_mut().find(|e| e.batch_id == entry.batch_id) {
        Some(existing) => Some(std::mem::replace(existing, entry)),
        None => {
            entries.push(entry);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::test_settings;

    #[test]
    fn test_upsert_replaces_by_batch_id() {
        let state = BatchState::new(test_settings(1), ["a.mp3"]);
        let mut entries = Vec::new();

        assert!(upsert(&mut entries, IndexEntry::from_state(&state, "first.json")).is_none());
        let replaced = upsert(&mut entries, IndexEntry::from_state(&state, "second.json"));

        assert_eq!(replaced.unwrap().filename, "first.json");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "second.json");
    }

    #[test]
    fn test_load_corrupted_index_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        fs_err::write(&path, "[{\"batch_id\": 3").unwrap();

        assert!(load(&path).is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_load_undecodable_index_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        fs_err::write(&path, [0x5b, 0xff, 0xfe, 0x5d]).unwrap();

        assert!(load(&path).is_empty());
        assert!(!path.exists());
        let quarantined = fs_err::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("index.json.corrupted_"));
        assert!(quarantined);
    }

    #[test]
    fn test_index_entry_wire_format() {
        let state = BatchState::new(test_settings(1), ["a.mp3"]);
        let value = serde_json::to_value(IndexEntry::from_state(&state, "x.json")).unwrap();

        assert_eq!(value["status"], "active");
        assert_eq!(value["completed_at"], serde_json::Value::Null);
        assert_eq!(value["total_files"], 1);
        assert_eq!(value["completed_files"], 0);
        assert_eq!(value["filename"], "x.json");
    }
}
