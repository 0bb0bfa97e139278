use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

use crate::BatchError;

pub mod resume;

/// Processing status of a single file in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Converting,
    Transcribing,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Converting => "converting",
            FileStatus::Transcribing => "transcribing",
            FileStatus::Retrying => "retrying",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
        }
    }

    /// A file is being worked on right now (or was, when the process died)
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            FileStatus::Converting | FileStatus::Transcribing | FileStatus::Retrying
        )
    }

    /// Which statistics counter this status is accounted under
    fn bucket(&self) -> Bucket {
        match self {
            FileStatus::Completed => Bucket::Completed,
            FileStatus::Failed => Bucket::Failed,
            FileStatus::Skipped => Bucket::Skipped,
            _ => Bucket::Pending,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Pending,
    Completed,
    Failed,
    Skipped,
}

/// Lifecycle status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Archived,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Active => "active",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transcript output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Plain text
    #[default]
    Txt,
    /// SRT subtitle format
    Srt,
    /// WebVTT format
    Vtt,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Srt => "srt",
            OutputFormat::Vtt => "vtt",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Settings snapshot captured when a batch is created. Never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    pub output_format: OutputFormat,
    pub output_dir: Option<String>,
    pub language: String,
    pub diarize: bool,
    pub smart_format: bool,
    pub max_concurrent_workers: usize,
}

/// State of one work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    /// Source media path, unique within the batch
    pub source_path: String,
    pub status: FileStatus,
    pub output_path: Option<String>,
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub retry_count: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl FileState {
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            status: FileStatus::Pending,
            output_path: None,
            duration_seconds: None,
            retry_count: 0,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn source(&self) -> &Path {
        Path::new(&self.source_path)
    }

    /// File name for display purposes
    pub fn name(&self) -> String {
        self.source()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source_path.clone())
    }
}

/// Counters derived from `files`, kept in sync by [`BatchState::apply_update`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub total_files: usize,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub failed: usize,
    pub pending: usize,
    #[serde(default)]
    pub total_duration_seconds: f64,
}

impl BatchStatistics {
    fn for_new_batch(total_files: usize) -> Self {
        Self {
            total_files,
            completed: 0,
            failed: 0,
            pending: total_files,
            total_duration_seconds: 0.0,
        }
    }

    /// Files in the skipped bucket; not stored, implied by the other counters
    pub fn skipped(&self) -> usize {
        self.total_files
            .saturating_sub(self.completed + self.failed + self.pending)
    }

    fn leave(&mut self, bucket: Bucket, duration: f64) {
        match bucket {
            Bucket::Pending => self.pending = self.pending.saturating_sub(1),
            Bucket::Completed => {
                self.completed = self.completed.saturating_sub(1);
                self.total_duration_seconds = (self.total_duration_seconds - duration).max(0.0);
            }
            Bucket::Failed => self.failed = self.failed.saturating_sub(1),
            Bucket::Skipped => {}
        }
    }

    fn enter(&mut self, bucket: Bucket, duration: f64) {
        match bucket {
            Bucket::Pending => self.pending += 1,
            Bucket::Completed => {
                self.completed += 1;
                self.total_duration_seconds += duration;
            }
            Bucket::Failed => self.failed += 1,
            Bucket::Skipped => {}
        }
    }
}

/// A transition applied to one file of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum FileUpdate {
    /// Back to the queue; clears output, error and completion time
    Pending,
    /// A pipeline stage started (converting, transcribing or retrying)
    Stage(FileStatus),
    Completed {
        output_path: String,
        duration_seconds: Option<f64>,
    },
    Failed(String),
    Skipped(String),
}

impl FileUpdate {
    pub fn status(&self) -> FileStatus {
        match self {
            FileUpdate::Pending => FileStatus::Pending,
            FileUpdate::Stage(status) => *status,
            FileUpdate::Completed { .. } => FileStatus::Completed,
            FileUpdate::Failed(_) => FileStatus::Failed,
            FileUpdate::Skipped(_) => FileStatus::Skipped,
        }
    }
}

/// Aggregate root for one run of the pipeline over a fixed set of files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub settings: BatchSettings,
    pub files: Vec<FileState>,
    pub statistics: BatchStatistics,
    #[serde(default)]
    pub status: BatchStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchState {
    /// Create a new active batch with every file pending
    pub fn new<I, S>(settings: BatchSettings, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let files: Vec<FileState> = sources.into_iter().map(FileState::new).collect();
        let now = Utc::now();

        Self {
            batch_id: Uuid::new_v4().to_string(),
            created_at: now,
            last_updated: now,
            settings,
            statistics: BatchStatistics::for_new_batch(files.len()),
            files,
            status: BatchStatus::Active,
            completed_at: None,
        }
    }

    pub fn index_of(&self, source_path: &str) -> Option<usize> {
        self.files.iter().position(|f| f.source_path == source_path)
    }

    /// Apply a transition to the file at `index`, keeping the statistics in step.
    ///
    /// Every status change of a file goes through here. Returns the previous status.
    pub fn apply_update(&mut self, index: usize, update: FileUpdate) -> Result<FileStatus, BatchError> {
        let file = self
            .files
            .get_mut(index)
            .ok_or_else(|| BatchError::UnknownFile(format!("index {index}")))?;

        let old_status = file.status;
        let old_duration = completed_duration(file);
        let new_status = update.status();

        match update {
            FileUpdate::Pending => {
                file.output_path = None;
                file.error_message = None;
                file.completed_at = None;
            }
            FileUpdate::Stage(_) => {}
            FileUpdate::Completed {
                output_path,
                duration_seconds,
            } => {
                file.output_path = Some(output_path);
                file.duration_seconds = duration_seconds;
                file.completed_at = Some(Utc::now());
                file.error_message = None;
            }
            FileUpdate::Failed(message) | FileUpdate::Skipped(message) => {
                file.output_path = None;
                file.completed_at = None;
                file.error_message = Some(message);
            }
        }
        file.status = new_status;
        let new_duration = completed_duration(file);

        self.statistics.leave(old_status.bucket(), old_duration);
        self.statistics.enter(new_status.bucket(), new_duration);

        Ok(old_status)
    }

    /// Files that still need work: queued, failed, skipped, or interrupted mid-stage
    pub fn incomplete_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| {
                matches!(
                    f.status,
                    FileStatus::Pending | FileStatus::Failed | FileStatus::Skipped
                ) || f.status.is_in_flight()
            })
            .count()
    }

    pub fn count_with_status(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }

    pub fn failed_sources(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Failed)
            .map(|f| f.source_path.clone())
            .collect()
    }

    /// Field checks applied to every record read back from disk
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.batch_id.trim().is_empty() {
            return Err(BatchError::InvalidState("empty batch_id".to_string()));
        }

        if self.settings.max_concurrent_workers == 0 {
            return Err(BatchError::InvalidState(
                "max_concurrent_workers must be at least 1".to_string(),
            ));
        }

        if self.statistics.total_files != self.files.len() {
            return Err(BatchError::InvalidState(format!(
                "total_files is {} but batch holds {} files",
                self.statistics.total_files,
                self.files.len()
            )));
        }

        let mut seen = HashSet::new();
        for file in &self.files {
            if file.source_path.is_empty() {
                return Err(BatchError::InvalidState("empty source_path".to_string()));
            }
            if !seen.insert(file.source_path.as_str()) {
                return Err(BatchError::InvalidState(format!(
                    "duplicate source_path: {}",
                    file.source_path
                )));
            }
        }

        Ok(())
    }
}

fn completed_duration(file: &FileState) -> f64 {
    if file.status == FileStatus::Completed {
        file.duration_seconds.unwrap_or(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
pub(crate) fn test_settings(workers: usize) -> BatchSettings {
    BatchSettings {
        output_format: OutputFormat::Txt,
        output_dir: None,
        language: "en".to_string(),
        diarize: false,
        smart_format: true,
        max_concurrent_workers: workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(state: &BatchState) {
        let stats = &state.statistics;
        assert_eq!(
            stats.completed + stats.failed + stats.pending + stats.skipped(),
            stats.total_files
        );
        assert_eq!(stats.skipped(), state.count_with_status(FileStatus::Skipped));

        let expected: f64 = state
            .files
            .iter()
            .filter(|f| f.status == FileStatus::Completed)
            .filter_map(|f| f.duration_seconds)
            .sum();
        assert!((stats.total_duration_seconds - expected).abs() < 1e-9);
    }

    #[test]
    fn test_new_batch_is_active_and_pending() {
        let state = BatchState::new(test_settings(2), ["a.mp3", "b.mp4"]);

        assert_eq!(state.status, BatchStatus::Active);
        assert_eq!(state.statistics.total_files, 2);
        assert_eq!(state.statistics.pending, 2);
        assert!(state.files.iter().all(|f| f.status == FileStatus::Pending));
        assert!(Uuid::parse_str(&state.batch_id).is_ok());
        assert_consistent(&state);
    }

    #[test]
    fn test_apply_update_moves_counters() {
        let mut state = BatchState::new(test_settings(2), ["a.mp3", "b.mp3", "c.mp3"]);

        state.apply_update(0, FileUpdate::Stage(FileStatus::Transcribing)).unwrap();
        assert_eq!(state.statistics.pending, 3);

        state
            .apply_update(
                0,
                FileUpdate::Completed {
                    output_path: "a.txt".to_string(),
                    duration_seconds: Some(12.5),
                },
            )
            .unwrap();
        state.apply_update(1, FileUpdate::Failed("HTTP 503".to_string())).unwrap();
        state.apply_update(2, FileUpdate::Skipped("Cancelled by user".to_string())).unwrap();

        assert_eq!(state.statistics.completed, 1);
        assert_eq!(state.statistics.failed, 1);
        assert_eq!(state.statistics.pending, 0);
        assert_eq!(state.statistics.skipped(), 1);
        assert_eq!(state.statistics.total_duration_seconds, 12.5);
        assert!(state.files[0].completed_at.is_some());
        assert_consistent(&state);
    }

    #[test]
    fn test_reset_completed_file_repairs_duration() {
        let mut state = BatchState::new(test_settings(1), ["a.mp3", "b.mp3"]);
        for (i, d) in [(0, 10.0), (1, 5.0)] {
            state
                .apply_update(
                    i,
                    FileUpdate::Completed {
                        output_path: format!("{i}.txt"),
                        duration_seconds: Some(d),
                    },
                )
                .unwrap();
        }

        let old = state.apply_update(1, FileUpdate::Pending).unwrap();

        assert_eq!(old, FileStatus::Completed);
        assert_eq!(state.files[1].output_path, None);
        assert_eq!(state.files[1].completed_at, None);
        assert_eq!(state.statistics.completed, 1);
        assert_eq!(state.statistics.pending, 1);
        assert_eq!(state.statistics.total_duration_seconds, 10.0);
        assert_consistent(&state);
    }

    #[test]
    fn test_failed_clears_output_path() {
        let mut state = BatchState::new(test_settings(1), ["a.mp3"]);
        state
            .apply_update(
                0,
                FileUpdate::Completed {
                    output_path: "a.txt".to_string(),
                    duration_seconds: None,
                },
            )
            .unwrap();
        state.apply_update(0, FileUpdate::Failed("disk full".to_string())).unwrap();

        assert_eq!(state.files[0].output_path, None);
        assert_eq!(state.files[0].error_message.as_deref(), Some("disk full"));
        assert_consistent(&state);
    }

    #[test]
    fn test_apply_update_out_of_range() {
        let mut state = BatchState::new(test_settings(1), ["a.mp3"]);
        assert!(matches!(
            state.apply_update(5, FileUpdate::Pending),
            Err(BatchError::UnknownFile(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_records() {
        let state = BatchState::new(test_settings(1), ["a.mp3", "a.mp3"]);
        assert!(state.validate().is_err());

        let mut state = BatchState::new(test_settings(1), ["a.mp3"]);
        state.statistics.total_files = 4;
        assert!(state.validate().is_err());

        let mut state = BatchState::new(test_settings(1), ["a.mp3"]);
        state.settings.max_concurrent_workers = 0;
        assert!(state.validate().is_err());

        let state = BatchState::new(test_settings(1), ["a.mp3"]);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_incomplete_count_includes_interrupted_files() {
        let mut state = BatchState::new(test_settings(1), ["a.mp3", "b.mp3", "c.mp3"]);
        state
            .apply_update(
                0,
                FileUpdate::Completed {
                    output_path: "a.txt".to_string(),
                    duration_seconds: None,
                },
            )
            .unwrap();
        state.apply_update(1, FileUpdate::Stage(FileStatus::Transcribing)).unwrap();

        assert_eq!(state.incomplete_count(), 2);
    }

    #[test]
    fn test_enums_serialize_lowercase() {
        let json = serde_json::to_string(&FileStatus::Transcribing).unwrap();
        assert_eq!(json, "\"transcribing\"");
        let json = serde_json::to_string(&BatchStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        let json = serde_json::to_string(&OutputFormat::Vtt).unwrap();
        assert_eq!(json, "\"vtt\"");
    }
}
