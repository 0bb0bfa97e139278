use std::path::{Path, PathBuf};

use super::{atomic, parse_state, BatchStore};
use crate::BatchError;

impl BatchStore {
    /// Move a legacy single-file batch state (`batch_state.json`) into `active.json`.
    ///
    /// Safe to run on every startup. The legacy file is always backed up before it is
    /// removed. When an active record already exists the legacy file is only retired.
    /// Returns whether a batch was migrated.
    pub fn migrate_legacy(&self, legacy: &Path) -> Result<bool, BatchError> {
        if !legacy.exists() {
            tracing::debug!("No legacy batch state to migrate");
            return Ok(false);
        }

        // Loading quarantines a corrupted active record, which then does not count
        if self.load_active().is_some() {
            tracing::info!("Active batch already present, retiring legacy state file");
            backup_legacy(legacy)?;
            atomic::remove_if_exists(legacy)?;
            return Ok(false);
        }

        let backup = backup_legacy(legacy)?;

        let content = fs_err::read(legacy)?;
        let mut state = match parse_state(&content) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Legacy batch state is unreadable, not migrating: {}", e);
                atomic::remove_if_exists(legacy)?;
                return Ok(false);
            }
        };

        self.save_active(&mut state)?;
        atomic::remove_if_exists(legacy)?;

        tracing::info!(
            "Migrated batch {} to {} (backup at {})",
            state.batch_id,
            self.active_path().display(),
            backup.display()
        );
        Ok(true)
    }
}

fn backup_legacy(legacy: &Path) -> Result<PathBuf, BatchError> {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup = legacy.with_extension(format!("backup_{timestamp}.json"));
    fs_err::copy(legacy, &backup)?;
    tracing::info!("Created backup: {}", backup.display());
    Ok(backup)
}
