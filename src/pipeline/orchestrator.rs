//! Runs a batch through the pipeline with a bounded pool of workers.
//!
//! Phase 1 processes every queued file concurrently, at most
//! `max_concurrent_workers` at a time. Phase 2 gives each file that failed with a
//! retryable error one more sequential attempt after a backoff. The batch is then
//! archived, or paused when the run was cancelled with work left.
//!
//! All workers share one [`BatchState`] behind a mutex. Every transition mutates
//! the file at its index and hands a snapshot to the writer before the lock is
//! released, so snapshots reach the writer in the order the mutations happened.

use anyhow::Context;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{
    Collaborators, EventExtra, MediaKind, ProgressObserver, Stage, TranscribeOptions,
};
use crate::batch::{BatchSettings, BatchState, BatchStatus, FileState, FileStatus, FileUpdate};
use crate::classify::{classify, retry_delay, ErrorCategory};
use crate::store::BatchStore;
use crate::writer::BatchWriter;
use crate::Result;

const CANCELLED_MESSAGE: &str = "Cancelled by user";

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Automatic attempts after the first failure (phase 2)
    pub auto_retries: u32,
    /// Manual retries allowed on top of the automatic ones
    pub max_manual_retries: u32,
    /// Multiplier applied to every backoff delay; 0 disables the wait
    pub backoff_scale: f64,
    /// How long to wait for pending writes before archiving or pausing
    pub flush_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            auto_retries: 1,
            max_manual_retries: 3,
            backoff_scale: 1.0,
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl OrchestratorOptions {
    /// Highest `retry_count` a file may have and still be retried by hand
    pub fn retry_cap(&self) -> u32 {
        self.auto_retries.saturating_add(self.max_manual_retries)
    }
}

/// Outcome of a run, as shown to the user
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub batch_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_files: Vec<String>,
    pub cancelled: bool,
    pub total_duration_seconds: f64,
}

impl RunReport {
    pub fn from_state(state: &BatchState, cancelled: bool) -> Self {
        Self {
            batch_id: state.batch_id.clone(),
            succeeded: state.count_with_status(FileStatus::Completed),
            failed: state.count_with_status(FileStatus::Failed),
            skipped: state.count_with_status(FileStatus::Skipped),
            failed_files: state.failed_sources(),
            cancelled,
            total_duration_seconds: state.statistics.total_duration_seconds,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && !self.cancelled
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} succeeded, {} failed", self.succeeded, self.failed)?;
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}

/// Final state of a run together with its report
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub state: BatchState,
}

type SharedState = Arc<Mutex<BatchState>>;

enum StageError {
    Cancelled,
    Failed(String),
}

impl StageError {
    fn failed(error: anyhow::Error) -> Self {
        StageError::Failed(format!("{error:#}"))
    }
}

/// Everything a single file needs; cloned into each worker task
#[derive(Clone)]
struct Worker {
    collaborators: Collaborators,
    writer: Arc<BatchWriter>,
    observer: Option<Arc<dyn ProgressObserver>>,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    worker: Worker,
    store: Arc<BatchStore>,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        collaborators: Collaborators,
        store: Arc<BatchStore>,
        writer: Arc<BatchWriter>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            worker: Worker {
                collaborators,
                writer,
                observer: None,
                cancel: CancellationToken::new(),
            },
            store,
            options,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.worker.observer = Some(observer);
        self
    }

    /// Token that stops the run; in-flight collaborator calls are allowed to finish
    pub fn cancellation_token(&self) -> CancellationToken {
        self.worker.cancel.clone()
    }

    pub fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.worker.cancel.cancel();
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Process every pending file of `state`, retry retryable failures once, then
    /// archive the batch (or pause it when cancelled with work left).
    pub async fn run(&self, state: BatchState) -> Result<RunOutcome> {
        let queued: Vec<usize> = state
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.status == FileStatus::Pending)
            .map(|(i, _)| i)
            .collect();

        self.execute(state, queued, false).await
    }

    /// Re-run the failed files of `state` that have retries left.
    ///
    /// A retry counts against the cap once its file is handed to a worker, so a
    /// file skipped by cancellation keeps the retry.
    pub async fn retry_failed(&self, mut state: BatchState) -> Result<RunOutcome> {
        let cap = self.options.retry_cap();
        let mut queued = Vec::new();

        for index in 0..state.files.len() {
            let file = &state.files[index];
            if file.status != FileStatus::Failed {
                continue;
            }
            if file.retry_count >= cap {
                tracing::warn!(
                    "{} has used all {} retries, leaving it failed",
                    file.name(),
                    cap
                );
                continue;
            }

            state.apply_update(index, FileUpdate::Pending)?;
            queued.push(index);
        }

        if queued.is_empty() {
            tracing::info!("No failed files eligible for retry in batch {}", state.batch_id);
        }

        self.execute(state, queued, true).await
    }

    async fn execute(
        &self,
        mut state: BatchState,
        queued: Vec<usize>,
        manual_retry: bool,
    ) -> Result<RunOutcome> {
        state.status = BatchStatus::Active;
        tracing::info!(
            "Processing batch {}: {} of {} files queued, {} workers",
            state.batch_id,
            queued.len(),
            state.files.len(),
            state.settings.max_concurrent_workers
        );

        let shared: SharedState = Arc::new(Mutex::new(state));
        {
            let state = shared.lock();
            self.worker.writer.schedule_write(state.clone());
        }

        self.process_queue(&shared, &queued, manual_retry).await;

        if !self.worker.cancel.is_cancelled() {
            self.retry_retryable(&shared).await;
        }

        let cancelled = self.worker.cancel.is_cancelled();
        let mut state = match Arc::try_unwrap(shared) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => shared.lock().clone(),
        };

        self.finish(&mut state, cancelled).await?;

        let report = RunReport::from_state(&state, cancelled);
        tracing::info!("Batch {} finished: {}", state.batch_id, report);
        Ok(RunOutcome { report, state })
    }

    /// Phase 1: bounded concurrent pass over `queued`
    async fn process_queue(&self, shared: &SharedState, queued: &[usize], manual_retry: bool) {
        if queued.is_empty() {
            return;
        }

        let workers = shared.lock().settings.max_concurrent_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        for (position, &index) in queued.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.worker.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };

            match permit {
                Some(permit) if !self.worker.cancel.is_cancelled() => {
                    if manual_retry {
                        shared.lock().files[index].retry_count += 1;
                    }
                    let worker = self.worker.clone();
                    let shared = Arc::clone(shared);
                    tasks.spawn(async move {
                        worker.process_guarded(&shared, index).await;
                        drop(permit);
                    });
                }
                _ => {
                    self.worker.skip_unstarted(shared, &queued[position..]);
                    break;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Worker task ended abnormally: {}", e);
            }
        }
    }

    /// Phase 2: one sequential retry for failures classified as retryable
    async fn retry_retryable(&self, shared: &SharedState) {
        let auto_retries = self.options.auto_retries;
        let candidates: Vec<(usize, ErrorCategory)> = {
            let state = shared.lock();
            state
                .files
                .iter()
                .enumerate()
                .filter(|(_, f)| f.status == FileStatus::Failed && f.retry_count < auto_retries)
                .filter_map(|(i, f)| {
                    let (category, retryable) = classify(f.error_message.as_deref().unwrap_or_default());
                    retryable.then_some((i, category))
                })
                .collect()
        };

        if candidates.is_empty() {
            return;
        }
        tracing::info!("Retrying {} failed file(s)", candidates.len());

        for (index, category) in candidates {
            let attempt = shared.lock().files[index].retry_count + 1;
            let delay = self.scaled_delay(category, attempt);

            tokio::select! {
                _ = self.worker.cancel.cancelled() => {
                    tracing::info!("Retry phase cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            {
                let mut state = shared.lock();
                state.files[index].retry_count = attempt;
                tracing::info!(
                    "Retrying {} (attempt {}, {:?})",
                    state.files[index].name(),
                    attempt,
                    category
                );
            }
            self.worker
                .transition(shared, index, FileUpdate::Stage(FileStatus::Retrying), None);
            self.worker.process_guarded(shared, index).await;
        }
    }

    fn scaled_delay(&self, category: ErrorCategory, attempt: u32) -> Duration {
        let base = retry_delay(category, attempt);
        Duration::try_from_secs_f64(base.as_secs_f64() * self.options.backoff_scale)
            .unwrap_or(base)
    }

    /// Drain the writer, then archive or pause.
    ///
    /// The flush has to come first: a snapshot written after `complete` would
    /// bring the active record back.
    async fn finish(&self, state: &mut BatchState, cancelled: bool) -> Result<()> {
        if !self.worker.writer.flush(self.options.flush_timeout).await {
            tracing::warn!(
                "Pending writes for batch {} were not confirmed",
                state.batch_id
            );
        }

        if cancelled && state.incomplete_count() > 0 {
            self.store
                .pause(state)
                .with_context(|| format!("Failed to pause batch {}", state.batch_id))?;
        } else {
            self.store
                .complete(state)
                .with_context(|| format!("Failed to archive batch {}", state.batch_id))?;
        }
        Ok(())
    }
}

impl Worker {
    /// Run one file, turning a panic anywhere in the pipeline into a failure
    async fn process_guarded(&self, shared: &SharedState, index: usize) -> bool {
        match AssertUnwindSafe(self.process_file(shared, index))
            .catch_unwind()
            .await
        {
            Ok(succeeded) => succeeded,
            Err(panic) => {
                let message = format!("Worker panicked: {}", panic_message(&*panic));
                tracing::error!("{}", message);
                self.transition(
                    shared,
                    index,
                    FileUpdate::Failed(message.clone()),
                    Some((Stage::Failed, error_extra(&message))),
                );
                false
            }
        }
    }

    async fn process_file(&self, shared: &SharedState, index: usize) -> bool {
        let (source, settings) = {
            let state = shared.lock();
            (
                PathBuf::from(&state.files[index].source_path),
                state.settings.clone(),
            )
        };

        let mut temp_audio = None;
        let result = self
            .run_stages(shared, index, &source, &settings, &mut temp_audio)
            .await;

        if let Some(audio) = temp_audio {
            self.collaborators.converter.cleanup(&audio).await;
        }

        match result {
            Ok((output, duration_seconds)) => {
                let output_path = output.to_string_lossy().into_owned();
                let mut extra = EventExtra::new();
                extra.insert("output_path".to_string(), output_path.clone());
                if let Some(duration) = duration_seconds {
                    extra.insert("duration_seconds".to_string(), format!("{duration:.1}"));
                }

                tracing::info!("Completed {}", source.display());
                self.transition(
                    shared,
                    index,
                    FileUpdate::Completed {
                        output_path,
                        duration_seconds,
                    },
                    Some((Stage::Completed, extra)),
                );
                true
            }
            Err(StageError::Cancelled) => {
                tracing::info!("Stopped {} before its next stage", source.display());
                self.transition(
                    shared,
                    index,
                    FileUpdate::Skipped(CANCELLED_MESSAGE.to_string()),
                    Some((Stage::Failed, error_extra(CANCELLED_MESSAGE))),
                );
                false
            }
            Err(StageError::Failed(message)) => {
                tracing::warn!("Failed {}: {}", source.display(), message);
                let extra = error_extra(&message);
                self.transition(
                    shared,
                    index,
                    FileUpdate::Failed(message),
                    Some((Stage::Failed, extra)),
                );
                false
            }
        }
    }

    async fn run_stages(
        &self,
        shared: &SharedState,
        index: usize,
        source: &Path,
        settings: &BatchSettings,
        temp_audio: &mut Option<PathBuf>,
    ) -> std::result::Result<(PathBuf, Option<f64>), StageError> {
        self.checkpoint()?;

        let audio = if MediaKind::from_path(source).needs_conversion() {
            self.transition(
                shared,
                index,
                FileUpdate::Stage(FileStatus::Converting),
                Some((Stage::Converting, EventExtra::new())),
            );
            let audio = self
                .collaborators
                .converter
                .convert(source)
                .await
                .map_err(StageError::failed)?;
            *temp_audio = Some(audio.clone());
            self.checkpoint()?;
            audio
        } else {
            source.to_path_buf()
        };

        self.transition(
            shared,
            index,
            FileUpdate::Stage(FileStatus::Transcribing),
            Some((Stage::Transcribing, EventExtra::new())),
        );
        let options = TranscribeOptions {
            language: settings.language.clone(),
            diarize: settings.diarize,
            smart_format: settings.smart_format,
        };
        let transcript = self
            .collaborators
            .transcriber
            .transcribe(&audio, &options)
            .await
            .map_err(StageError::failed)?;
        self.checkpoint()?;

        let file = shared.lock().files[index].clone();
        self.emit(Stage::Saving, &file, &EventExtra::new());

        let output_dir = settings.output_dir.as_deref().map(Path::new);
        let output = self
            .collaborators
            .writer
            .save(&transcript, source, settings.output_format, output_dir)
            .await
            .map_err(StageError::failed)?;

        Ok((output, transcript.duration_seconds))
    }

    fn checkpoint(&self) -> std::result::Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Apply `update` under the state lock, queue the snapshot, then notify
    fn transition(
        &self,
        shared: &SharedState,
        index: usize,
        update: FileUpdate,
        event: Option<(Stage, EventExtra)>,
    ) {
        let file = {
            let mut state = shared.lock();
            if let Err(e) = state.apply_update(index, update) {
                tracing::error!("Failed to update file {}: {}", index, e);
                return;
            }
            self.writer.schedule_write(state.clone());
            state.files[index].clone()
        };

        if let Some((stage, extra)) = event {
            self.emit(stage, &file, &extra);
        }
    }

    fn skip_unstarted(&self, shared: &SharedState, indices: &[usize]) {
        let skipped: Vec<FileState> = {
            let mut state = shared.lock();
            let mut skipped = Vec::new();
            for &index in indices {
                if state.files[index].status != FileStatus::Pending {
                    continue;
                }
                if state
                    .apply_update(index, FileUpdate::Skipped(CANCELLED_MESSAGE.to_string()))
                    .is_ok()
                {
                    skipped.push(state.files[index].clone());
                }
            }
            if !skipped.is_empty() {
                self.writer.schedule_write(state.clone());
            }
            skipped
        };

        tracing::info!("Cancelled: skipped {} file(s) that had not started", skipped.len());
        let extra = error_extra(CANCELLED_MESSAGE);
        for file in &skipped {
            self.emit(Stage::Failed, file, &extra);
        }
    }

    fn emit(&self, stage: Stage, file: &FileState, extra: &EventExtra) {
        let Some(observer) = &self.observer else {
            return;
        };

        let delivered =
            std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(stage, file, extra)));
        if let Err(panic) = delivered {
            tracing::warn!(
                "Progress observer panicked on {} for {}: {}",
                stage,
                file.name(),
                panic_message(&*panic)
            );
        }
    }
}

fn error_extra(message: &str) -> EventExtra {
    EventExtra::from([("error".to_string(), message.to_string())])
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::test_settings;
    use crate::pipeline::output::TextOutputWriter;
    use crate::pipeline::{MediaConverter, MockTranscriber, Transcriber, Transcript};
    use crate::writer::WriterOptions;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};

    /// Pretends to convert; remembers what it was asked to clean up
    #[derive(Default)]
    struct FakeConverter {
        cleaned: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl MediaConverter for FakeConverter {
        async fn convert(&self, source: &Path) -> Result<PathBuf> {
            Ok(source.with_extension("converted.mp3"))
        }

        async fn cleanup(&self, audio: &Path) {
            self.cleaned.lock().push(audio.to_path_buf());
        }
    }

    /// Replies per file name from a script, succeeding once the script runs out
    #[derive(Default)]
    struct ScriptedTranscriber {
        script: Mutex<HashMap<String, VecDeque<String>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTranscriber {
        fn failing(name: &str, errors: &[&str]) -> Self {
            let t = Self::default();
            t.script.lock().insert(
                name.to_string(),
                errors.iter().map(|e| e.to_string()).collect(),
            );
            t
        }

        fn calls_for(&self, name: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.as_str() == name).count()
        }
    }

    #[async_trait]
    impl Transcriber for ScriptedTranscriber {
        async fn transcribe(&self, audio: &Path, _options: &TranscribeOptions) -> Result<Transcript> {
            let name = audio
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.calls.lock().push(name.clone());

            let next_error = self.script.lock().get_mut(&name).and_then(|s| s.pop_front());
            match next_error {
                Some(error) => Err(anyhow::anyhow!(error)),
                None => Ok(Transcript {
                    text: format!("transcript of {name}"),
                    duration_seconds: Some(2.0),
                }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<(Stage, String)>>,
    }

    impl ProgressObserver for RecordingObserver {
        fn on_event(&self, stage: Stage, file: &FileState, _extra: &EventExtra) {
            self.events.lock().push((stage, file.name()));
        }
    }

    struct PanickingObserver;

    impl ProgressObserver for PanickingObserver {
        fn on_event(&self, _stage: Stage, _file: &FileState, _extra: &EventExtra) {
            panic!("observer exploded");
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        store: Arc<BatchStore>,
        writer: Arc<BatchWriter>,
        converter: Arc<FakeConverter>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(BatchStore::in_data_dir(dir.path()).unwrap());
            let writer = BatchWriter::start(
                Arc::clone(&store),
                WriterOptions {
                    min_interval: Duration::from_millis(5),
                    queue_capacity: 64,
                },
            );
            Self {
                dir,
                store,
                writer,
                converter: Arc::new(FakeConverter::default()),
            }
        }

        fn orchestrator(&self, transcriber: Arc<dyn Transcriber>) -> Orchestrator {
            let collaborators = Collaborators {
                converter: self.converter.clone(),
                transcriber,
                writer: Arc::new(TextOutputWriter::new()),
            };
            Orchestrator::new(
                collaborators,
                Arc::clone(&self.store),
                Arc::clone(&self.writer),
                OrchestratorOptions {
                    backoff_scale: 0.0,
                    ..OrchestratorOptions::default()
                },
            )
        }

        fn batch(&self, names: &[&str], workers: usize) -> BatchState {
            let mut settings = test_settings(workers);
            settings.output_dir = Some(self.dir.path().join("out").display().to_string());
            BatchState::new(
                settings,
                names.iter().map(|n| self.dir.path().join(n).display().to_string()),
            )
        }
    }

    #[tokio::test]
    async fn test_run_completes_and_archives() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(Arc::new(ScriptedTranscriber::default()));
        let state = h.batch(&["a.mp3", "b.wav", "c.flac"], 2);
        let batch_id = state.batch_id.clone();

        let outcome = orchestrator.run(state).await.unwrap();

        assert_eq!(outcome.report.to_string(), "3 succeeded, 0 failed");
        assert!(outcome.report.is_clean());
        assert_eq!(outcome.report.total_duration_seconds, 6.0);
        assert_eq!(outcome.state.status, BatchStatus::Completed);
        assert!(!h.store.has_active());

        let entries = h.store.list(None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].batch_id, batch_id);
        assert_eq!(entries[0].completed_files, 3);

        let out = h.dir.path().join("out/a.txt");
        assert_eq!(fs_err::read_to_string(out).unwrap(), "transcript of a.mp3\n");
    }

    #[tokio::test]
    async fn test_video_is_converted_and_audio_cleaned_up_on_failure() {
        let h = Harness::new();
        let transcriber = Arc::new(ScriptedTranscriber::failing(
            "talk.converted.mp3",
            &["File too large (max 2GB)"],
        ));
        let orchestrator = h.orchestrator(transcriber.clone());

        let outcome = orchestrator.run(h.batch(&["talk.mp4"], 1)).await.unwrap();

        assert_eq!(outcome.report.failed, 1);
        assert_eq!(transcriber.calls_for("talk.converted.mp3"), 1);
        assert_eq!(h.converter.cleaned.lock().len(), 1);
        // Non-retryable: no automatic retry
        assert_eq!(outcome.state.files[0].retry_count, 0);
        assert_eq!(
            outcome.state.files[0].error_message.as_deref(),
            Some("File too large (max 2GB)")
        );
    }

    #[tokio::test]
    async fn test_retryable_failure_gets_one_automatic_retry() {
        let h = Harness::new();
        let transcriber = Arc::new(ScriptedTranscriber::failing("b.mp3", &["HTTP 503 from upstream"]));
        let orchestrator = h.orchestrator(transcriber.clone());

        let outcome = orchestrator.run(h.batch(&["a.mp3", "b.mp3"], 2)).await.unwrap();

        assert_eq!(outcome.report.succeeded, 2);
        assert_eq!(transcriber.calls_for("b.mp3"), 2);
        assert_eq!(outcome.state.files[1].retry_count, 1);
        assert_eq!(outcome.state.files[1].error_message, None);
    }

    #[tokio::test]
    async fn test_automatic_retry_happens_only_once() {
        let h = Harness::new();
        let transcriber = Arc::new(ScriptedTranscriber::failing(
            "a.mp3",
            &["connection reset by peer", "connection reset by peer"],
        ));
        let orchestrator = h.orchestrator(transcriber.clone());

        let outcome = orchestrator.run(h.batch(&["a.mp3"], 1)).await.unwrap();

        assert_eq!(transcriber.calls_for("a.mp3"), 2);
        assert_eq!(outcome.report.failed_files.len(), 1);
        assert_eq!(outcome.state.files[0].status, FileStatus::Failed);
        assert_eq!(outcome.state.files[0].retry_count, 1);
        // Failed files still complete the batch
        assert_eq!(outcome.state.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_and_pauses() {
        let h = Harness::new();
        let transcriber = Arc::new(ScriptedTranscriber::default());
        let orchestrator = h.orchestrator(transcriber.clone());
        orchestrator.cancel();

        let outcome = orchestrator.run(h.batch(&["a.mp3", "b.mp3"], 2)).await.unwrap();

        assert!(outcome.report.cancelled);
        assert_eq!(outcome.report.skipped, 2);
        assert!(transcriber.calls.lock().is_empty());

        let active = h.store.load_active().unwrap();
        assert_eq!(active.status, BatchStatus::Paused);
        assert!(active
            .files
            .iter()
            .all(|f| f.status == FileStatus::Skipped
                && f.error_message.as_deref() == Some("Cancelled by user")));
        assert!(h.store.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_respects_retry_cap() {
        let h = Harness::new();
        let transcriber = Arc::new(ScriptedTranscriber::default());
        let orchestrator = h.orchestrator(transcriber.clone());

        let mut state = h.batch(&["a.mp3", "b.mp3", "c.mp3"], 2);
        state.apply_update(0, FileUpdate::Failed("HTTP 500".into())).unwrap();
        state.files[0].retry_count = 4;
        state.apply_update(1, FileUpdate::Failed("Invalid API key".into())).unwrap();
        state.files[1].retry_count = 1;
        state
            .apply_update(
                2,
                FileUpdate::Completed {
                    output_path: "c.txt".into(),
                    duration_seconds: Some(1.0),
                },
            )
            .unwrap();

        let outcome = orchestrator.retry_failed(state).await.unwrap();

        assert_eq!(transcriber.calls_for("a.mp3"), 0);
        assert_eq!(transcriber.calls_for("b.mp3"), 1);
        assert_eq!(transcriber.calls_for("c.mp3"), 0);
        assert_eq!(outcome.state.files[0].status, FileStatus::Failed);
        assert_eq!(outcome.state.files[1].status, FileStatus::Completed);
        assert_eq!(outcome.state.files[1].retry_count, 2);
        assert_eq!(outcome.report.to_string(), "2 succeeded, 1 failed");
    }

    #[tokio::test]
    async fn test_cancelled_retry_does_not_use_up_a_retry() {
        let h = Harness::new();
        let transcriber = Arc::new(ScriptedTranscriber::default());
        let orchestrator = h.orchestrator(transcriber.clone());

        let mut state = h.batch(&["a.mp3"], 1);
        state.apply_update(0, FileUpdate::Failed("HTTP 500".into())).unwrap();
        state.files[0].retry_count = 1;

        orchestrator.cancel();
        let outcome = orchestrator.retry_failed(state).await.unwrap();

        assert_eq!(transcriber.calls_for("a.mp3"), 0);
        assert_eq!(outcome.state.files[0].status, FileStatus::Skipped);
        assert_eq!(outcome.state.files[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_observer_sees_stages_and_its_panics_are_contained() {
        let h = Harness::new();
        let observer = Arc::new(RecordingObserver::default());
        let orchestrator = h
            .orchestrator(Arc::new(ScriptedTranscriber::default()))
            .with_observer(observer.clone());

        orchestrator.run(h.batch(&["clip.mkv"], 1)).await.unwrap();

        let stages: Vec<Stage> = observer.events.lock().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            stages,
            vec![Stage::Converting, Stage::Transcribing, Stage::Saving, Stage::Completed]
        );

        let orchestrator = h
            .orchestrator(Arc::new(ScriptedTranscriber::default()))
            .with_observer(Arc::new(PanickingObserver));
        let outcome = orchestrator.run(h.batch(&["x.mp3"], 1)).await.unwrap();
        assert_eq!(outcome.report.succeeded, 1);
    }

    #[tokio::test]
    async fn test_transcriber_receives_batch_settings() {
        let h = Harness::new();
        let mut mock = MockTranscriber::new();
        mock.expect_transcribe()
            .withf(|audio, options| audio.ends_with("a.mp3") && options.language == "de" && !options.diarize)
            .times(1)
            .returning(|_, _| {
                Ok(Transcript {
                    text: "hallo".to_string(),
                    duration_seconds: None,
                })
            });
        let orchestrator = h.orchestrator(Arc::new(mock));

        let mut state = h.batch(&["a.mp3"], 1);
        state.settings.language = "de".to_string();

        let outcome = orchestrator.run(state).await.unwrap();
        assert_eq!(outcome.report.succeeded, 1);
    }

    #[test]
    fn test_report_display() {
        let mut state = BatchState::new(test_settings(1), ["a.mp3", "b.mp3", "c.mp3"]);
        state.apply_update(0, FileUpdate::Failed("boom".into())).unwrap();
        state.apply_update(1, FileUpdate::Skipped("Cancelled by user".into())).unwrap();

        let report = RunReport::from_state(&state, true);

        assert_eq!(report.to_string(), "0 succeeded, 1 failed, 1 skipped (cancelled)");
        assert_eq!(report.failed_files, vec!["a.mp3".to_string()]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_retry_cap() {
        assert_eq!(OrchestratorOptions::default().retry_cap(), 4);
    }
}
