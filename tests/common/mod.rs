#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use batchscribe::batch::{BatchSettings, BatchState, FileState, OutputFormat};
use batchscribe::pipeline::orchestrator::{Orchestrator, OrchestratorOptions};
use batchscribe::pipeline::output::TextOutputWriter;
use batchscribe::pipeline::{
    Collaborators, EventExtra, MediaConverter, ProgressObserver, Stage, TranscribeOptions,
    Transcriber, Transcript,
};
use batchscribe::store::BatchStore;
use batchscribe::writer::{BatchWriter, WriterOptions};

pub struct PassthroughConverter;

#[async_trait]
impl MediaConverter for PassthroughConverter {
    async fn convert(&self, source: &Path) -> batchscribe::Result<PathBuf> {
        Ok(source.to_path_buf())
    }
}

/// Sleeps a little per file and fails the sources whose name is listed
#[derive(Default)]
pub struct FakeTranscriber {
    pub failing: HashSet<String>,
    pub failure: String,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeTranscriber {
    pub fn failing(names: &[&str], failure: &str) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            failure: failure.to_string(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(
        &self,
        audio: &Path,
        _options: &TranscribeOptions,
    ) -> batchscribe::Result<Transcript> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(1 + (call % 5) as u64)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.failing.contains(&name) {
            anyhow::bail!("{}", self.failure);
        }

        Ok(Transcript {
            text: format!("words from {name}"),
            duration_seconds: Some(1.5),
        })
    }
}

/// Cancels the run once `after` files have completed
pub struct CancelAfter {
    pub after: usize,
    pub token: tokio_util::sync::CancellationToken,
    pub completed: AtomicUsize,
}

impl ProgressObserver for CancelAfter {
    fn on_event(&self, stage: Stage, _file: &FileState, _extra: &EventExtra) {
        if stage == Stage::Completed
            && self.completed.fetch_add(1, Ordering::SeqCst) + 1 >= self.after
        {
            self.token.cancel();
        }
    }
}

pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub store: Arc<BatchStore>,
    pub writer: Arc<BatchWriter>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BatchStore::in_data_dir(&dir.path().join("data")).unwrap());
        let writer = BatchWriter::start(
            Arc::clone(&store),
            WriterOptions {
                min_interval: Duration::from_millis(20),
                queue_capacity: 16,
            },
        );
        Self { dir, store, writer }
    }

    pub fn settings(&self, workers: usize) -> BatchSettings {
        BatchSettings {
            output_format: OutputFormat::Txt,
            output_dir: Some(self.dir.path().join("out").display().to_string()),
            language: "en".to_string(),
            diarize: false,
            smart_format: true,
            max_concurrent_workers: workers,
        }
    }

    /// Create `count` source files named `file_<n>.mp3`
    pub fn sources(&self, count: usize) -> Vec<String> {
        let media = self.dir.path().join("media");
        fs_err::create_dir_all(&media).unwrap();
        (0..count)
            .map(|i| {
                let path = media.join(format!("file_{i:03}.mp3"));
                fs_err::write(&path, b"audio").unwrap();
                path.display().to_string()
            })
            .collect()
    }

    pub fn batch(&self, count: usize, workers: usize) -> BatchState {
        BatchState::new(self.settings(workers), self.sources(count))
    }

    pub fn orchestrator(&self, transcriber: Arc<dyn Transcriber>) -> Orchestrator {
        Orchestrator::new(
            Collaborators {
                converter: Arc::new(PassthroughConverter),
                transcriber,
                writer: Arc::new(TextOutputWriter::new()),
            },
            Arc::clone(&self.store),
            Arc::clone(&self.writer),
            OrchestratorOptions {
                backoff_scale: 0.0,
                ..OrchestratorOptions::default()
            },
        )
    }
}

/// Every counter agrees with the file list
pub fn assert_statistics_consistent(state: &BatchState) {
    use batchscribe::batch::FileStatus;

    let stats = &state.statistics;
    assert_eq!(stats.total_files, state.files.len());
    assert_eq!(stats.completed, state.count_with_status(FileStatus::Completed));
    assert_eq!(stats.failed, state.count_with_status(FileStatus::Failed));
    assert_eq!(stats.skipped(), state.count_with_status(FileStatus::Skipped));
    assert_eq!(
        stats.completed + stats.failed + stats.pending + stats.skipped(),
        stats.total_files
    );

    let expected: f64 = state
        .files
        .iter()
        .filter(|f| f.status == FileStatus::Completed)
        .filter_map(|f| f.duration_seconds)
        .sum();
    assert!((stats.total_duration_seconds - expected).abs() < 1e-6);
}
