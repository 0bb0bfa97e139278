use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::BatchError;

/// A fully written temporary file that has not replaced its target yet
pub(crate) struct StagedWrite {
    temp: NamedTempFile,
}

impl StagedWrite {
    /// Write `value` as pretty JSON into a uniquely named temp file inside `dir`.
    ///
    /// The temp file lives in the same directory as the target so the final rename
    /// never crosses a filesystem boundary. Dropping the value without committing
    /// removes the temp file.
    pub(crate) fn json<T: Serialize>(dir: &Path, prefix: &str, value: &T) -> Result<Self, BatchError> {
        let bytes = serde_json::to_vec_pretty(value)?;

        let mut temp = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempfile_in(dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;

        Ok(Self { temp })
    }

    /// Atomically replace `target` with the staged content
    pub(crate) fn commit(self, target: &Path) -> Result<(), BatchError> {
        self.temp.persist(target).map_err(|e| BatchError::Io(e.error))?;
        Ok(())
    }
}

pub(crate) fn write_json<T: Serialize>(
    dir: &Path,
    prefix: &str,
    target: &Path,
    value: &T,
) -> Result<(), BatchError> {
    StagedWrite::json(dir, prefix, value)?.commit(target)
}

/// Copy a bad file aside as `<name>.corrupted_<timestamp>` and remove the original
pub(crate) fn quarantine(path: &Path) -> Option<PathBuf> {
    if !path.exists() {
        return None;
    }

    let file_name = path.file_name()?.to_string_lossy().into_owned();
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup = path.with_file_name(format!("{file_name}.corrupted_{timestamp}"));

    let result = fs_err::copy(path, &backup).and_then(|_| fs_err::remove_file(path));
    match result {
        Ok(()) => {
            tracing::info!("Backed up corrupted file to: {}", backup.display());
            Some(backup)
        }
        Err(e) => {
            tracing::warn!("Failed to back up corrupted file: {}", e);
            None
        }
    }
}

/// Remove a file, treating "already gone" as success. Returns whether anything was removed.
pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
