use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::progress::TerminalProgress;
use super::{Commands, HistoryCommand};
use crate::batch::resume::{prepare_resume, ResumeOutcome};
use crate::batch::{BatchState, BatchStatus, FileStatus, FileUpdate, OutputFormat};
use crate::config::AppConfig;
use crate::pipeline::command::CommandTranscriber;
use crate::pipeline::ffmpeg::FfmpegConverter;
use crate::pipeline::orchestrator::{Orchestrator, RunReport};
use crate::pipeline::output::TextOutputWriter;
use crate::pipeline::Collaborators;
use crate::store::BatchStore;
use crate::utils::{collect_sources, format_duration, format_file_size};
use crate::writer::BatchWriter;
use crate::BatchError;

const LEGACY_STATE_FILE: &str = "batch_state.json";

/// Options for a new batch as given on the command line
#[derive(Debug, Default)]
pub struct NewBatch {
    pub files: Vec<PathBuf>,
    pub format: Option<OutputFormat>,
    pub output_dir: Option<PathBuf>,
    pub language: Option<String>,
    pub diarize: bool,
    pub no_smart_format: bool,
    pub workers: Option<usize>,
    pub discard_active: bool,
}

/// Everything a command needs: configuration, the store and the one writer
pub struct App {
    config: AppConfig,
    config_path: PathBuf,
    data_dir: PathBuf,
    store: Arc<BatchStore>,
    writer: Arc<BatchWriter>,
    quiet: bool,
}

impl App {
    pub fn new(config: AppConfig, config_path: PathBuf, quiet: bool) -> Result<Self> {
        let data_dir = config.data_dir()?;
        let store = Arc::new(
            BatchStore::in_data_dir(&data_dir)
                .with_context(|| format!("Failed to open batch store in {}", data_dir.display()))?,
        );
        let writer = BatchWriter::start(Arc::clone(&store), config.writer_options());

        Ok(Self {
            config,
            config_path,
            data_dir,
            store,
            writer,
            quiet,
        })
    }

    /// Startup housekeeping: legacy migration and history retention
    pub fn prepare(&self) {
        if let Err(e) = self.store.migrate_legacy(&self.data_dir.join(LEGACY_STATE_FILE)) {
            tracing::error!("Legacy batch state migration failed: {}", e);
        }

        if self.config.history.cleanup_on_start {
            if let Err(e) = self.store.cleanup_older_than(self.config.history.retention_days) {
                tracing::error!("History cleanup failed: {}", e);
            }
        }
    }

    pub async fn shutdown(&self) {
        self.writer.shutdown(self.config.flush_timeout()).await;
    }

    pub async fn execute(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Run {
                files,
                format,
                output_dir,
                language,
                diarize,
                no_smart_format,
                workers,
                discard_active,
            } => {
                self.run_new(NewBatch {
                    files,
                    format,
                    output_dir,
                    language,
                    diarize,
                    no_smart_format,
                    workers,
                    discard_active,
                })
                .await
            }
            Commands::Resume { keep_missing } => self.resume(keep_missing).await,
            Commands::Retry { batch_id } => self.retry(batch_id).await,
            Commands::Status => self.status(),
            Commands::Skip { source } => self.skip(&source),
            Commands::Dismiss => self.dismiss(),
            Commands::History { command } => self.history(command),
            Commands::Config { show } => {
                if show {
                    self.config.display(&self.config_path);
                } else {
                    println!("Config file: {}", self.config_path.display());
                    println!("Edit it to change settings, or run with --show to print them.");
                }
                Ok(())
            }
        }
    }

    async fn run_new(&self, request: NewBatch) -> Result<()> {
        if let Some(active) = self.store.load_active() {
            if !request.discard_active {
                anyhow::bail!(
                    "Batch {} is unfinished ({} of {} files left). Run `batchscribe resume` or pass --discard-active",
                    active.batch_id,
                    active.incomplete_count(),
                    active.files.len()
                );
            }
            self.store.dismiss_active()?;
        }

        let workers = self.config.validate_workers(request.workers)?;
        let sources = collect_sources(&request.files)?;
        let orchestrator = self.orchestrator()?;

        let mut settings = self.config.batch_settings(workers);
        if let Some(format) = request.format {
            settings.output_format = format;
        }
        if let Some(dir) = request.output_dir {
            settings.output_dir = Some(dir.display().to_string());
        }
        if let Some(language) = request.language {
            settings.language = language;
        }
        settings.diarize |= request.diarize;
        if request.no_smart_format {
            settings.smart_format = false;
        }

        let mut state = BatchState::new(settings, sources);
        self.store.save_active(&mut state)?;
        println!(
            "Started batch {} with {} files",
            style(&state.batch_id).cyan(),
            state.files.len()
        );

        let queued = state.count_with_status(FileStatus::Pending);
        self.process(orchestrator, state, queued, false).await
    }

    async fn resume(&self, keep_missing: bool) -> Result<()> {
        let mut plan = match prepare_resume(&self.store)? {
            ResumeOutcome::Nothing => {
                println!("No unfinished batch.");
                return Ok(());
            }
            ResumeOutcome::Finished(state) => {
                println!(
                    "Batch {} had nothing left to do and was archived: {}",
                    state.batch_id,
                    RunReport::from_state(&state, false)
                );
                return Ok(());
            }
            ResumeOutcome::Ready(plan) => plan,
        };

        let orchestrator = self.orchestrator()?;

        if !plan.requeued_outputs.is_empty() {
            println!(
                "{} {} completed file(s) lost their transcript and were queued again",
                style("!").yellow(),
                plan.requeued_outputs.len()
            );
        }
        if !plan.missing_sources.is_empty() {
            if keep_missing {
                println!(
                    "{} {} source file(s) are missing and will fail",
                    style("!").yellow(),
                    plan.missing_sources.len()
                );
            } else {
                let skipped = plan.skip_missing_sources();
                println!(
                    "{} Skipped {} file(s) whose source no longer exists",
                    style("!").yellow(),
                    skipped
                );
            }
        }

        let remaining = plan.remaining();
        println!(
            "Resuming batch {}: {} file(s) left",
            style(&plan.state.batch_id).cyan(),
            remaining
        );
        self.process(orchestrator, plan.state, remaining, false).await
    }

    async fn retry(&self, batch_id: Option<String>) -> Result<()> {
        let active = self.store.load_active();
        let mut state = match (batch_id, active.as_ref()) {
            (Some(id), Some(active)) if active.batch_id != id => {
                return Err(BatchError::ActiveBatchInUse(active.batch_id.clone()))
                    .context("Finish or dismiss the unfinished batch before retrying another one");
            }
            (Some(id), _) => self
                .store
                .load_by_id(&id)
                .with_context(|| format!("Batch not found: {id}"))?,
            (None, Some(active)) => active.clone(),
            (None, None) => return Err(BatchError::NoActiveBatch.into()),
        };

        let failed = state.count_with_status(FileStatus::Failed);
        if failed == 0 {
            println!("Batch {} has no failed files.", state.batch_id);
            return Ok(());
        }

        let orchestrator = self.orchestrator()?;
        // An archived batch becomes the active one again while it is retried
        self.store.save_active(&mut state)?;
        println!(
            "Retrying {} failed file(s) of batch {}",
            failed,
            style(&state.batch_id).cyan()
        );
        self.process(orchestrator, state, failed, true).await
    }

    fn status(&self) -> Result<()> {
        match self.store.load_active() {
            Some(state) => print_batch(&state, false),
            None => println!("No unfinished batch."),
        }
        Ok(())
    }

    fn skip(&self, source: &str) -> Result<()> {
        let active = self.store.load_active().ok_or(BatchError::NoActiveBatch)?;

        // Sources are recorded as absolute paths
        let source = Path::new(source)
            .canonicalize()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| source.to_string());

        let updated = self.store.update_file(
            &active.batch_id,
            &source,
            FileUpdate::Skipped("Skipped by user".to_string()),
        )?;
        println!(
            "Skipped {} ({} file(s) still pending)",
            source, updated.statistics.pending
        );
        Ok(())
    }

    fn dismiss(&self) -> Result<()> {
        if self.store.dismiss_active()? {
            println!("Dismissed the unfinished batch.");
        } else {
            println!("No unfinished batch.");
        }
        Ok(())
    }

    fn history(&self, command: HistoryCommand) -> Result<()> {
        match command {
            HistoryCommand::List { status } => {
                let entries = self.store.list(status);
                if entries.is_empty() {
                    println!("No archived batches.");
                    return Ok(());
                }
                for entry in entries {
                    println!(
                        "{}  {}  {:<9}  {}/{} files",
                        entry.created_at.format("%Y-%m-%d %H:%M"),
                        style(&entry.batch_id).cyan(),
                        status_label(entry.status),
                        entry.completed_files,
                        entry.total_files
                    );
                }
            }
            HistoryCommand::Show { batch_id } => {
                let state = self
                    .store
                    .load_by_id(&batch_id)
                    .with_context(|| format!("Batch not found: {batch_id}"))?;
                print_batch(&state, true);
            }
            HistoryCommand::Delete { batch_id } => {
                if self.store.delete(&batch_id)? {
                    println!("Deleted batch {}", batch_id);
                } else {
                    println!("Batch not found: {}", batch_id);
                }
            }
            HistoryCommand::Cleanup { days } => {
                let days = days.unwrap_or(self.config.history.retention_days);
                let deleted = self.store.cleanup_older_than(days)?;
                println!("Deleted {} batch(es) completed more than {} days ago", deleted, days);
            }
        }
        Ok(())
    }

    fn orchestrator(&self) -> Result<Orchestrator> {
        let collaborators = Collaborators {
            converter: Arc::new(FfmpegConverter::new(self.config.converter.clone())?),
            transcriber: Arc::new(CommandTranscriber::new(
                &self.config.transcriber,
                Some(self.config.converter.ffprobe.clone()),
            )?),
            writer: Arc::new(TextOutputWriter::new()),
        };

        Ok(Orchestrator::new(
            collaborators,
            Arc::clone(&self.store),
            Arc::clone(&self.writer),
            self.config.orchestrator_options(),
        ))
    }

    async fn process(
        &self,
        orchestrator: Orchestrator,
        state: BatchState,
        queued: usize,
        retry: bool,
    ) -> Result<()> {
        let progress = Arc::new(TerminalProgress::new(queued, self.quiet));
        let orchestrator = orchestrator.with_observer(progress.clone());

        let token = orchestrator.cancellation_token();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling, waiting for running files to finish...");
                token.cancel();
            }
        });

        let result = if retry {
            orchestrator.retry_failed(state).await
        } else {
            orchestrator.run(state).await
        };
        ctrl_c.abort();

        let outcome = result?;
        progress.finish(outcome.report.to_string());
        print_report(&outcome.report, outcome.state.incomplete_count() > 0);
        Ok(())
    }
}

fn print_report(report: &RunReport, paused: bool) {
    println!("{} {}", style("Done:").bold(), report);
    if report.total_duration_seconds > 0.0 {
        println!("Transcribed {} of media", format_duration(report.total_duration_seconds));
    }
    for source in &report.failed_files {
        println!("  {} {}", style("✗").red(), source);
    }

    if report.cancelled && paused {
        println!("Batch paused. Run `batchscribe resume` to continue.");
    } else if report.failed > 0 {
        println!(
            "Run `batchscribe retry {}` to try the failed files again.",
            report.batch_id
        );
    }
}

fn print_batch(state: &BatchState, with_files: bool) {
    let stats = &state.statistics;
    println!("Batch {}", style(&state.batch_id).cyan().bold());
    println!("  Status:   {}", status_label(state.status));
    println!("  Created:  {}", state.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = state.completed_at {
        println!("  Finished: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    println!(
        "  Settings: {} / {} / {} workers",
        state.settings.output_format, state.settings.language, state.settings.max_concurrent_workers
    );
    println!(
        "  Files:    {} total, {} completed, {} failed, {} pending, {} skipped",
        stats.total_files,
        stats.completed,
        stats.failed,
        stats.pending,
        stats.skipped()
    );
    if stats.total_duration_seconds > 0.0 {
        println!("  Media:    {}", format_duration(stats.total_duration_seconds));
    }

    for file in &state.files {
        if !with_files && file.status == FileStatus::Completed {
            continue;
        }

        let mut line = format!("    {:<12} {}", file.status.as_str(), file.source_path);
        if let Some(output) = &file.output_path {
            let size = fs_err::metadata(output)
                .map(|m| format_file_size(m.len()))
                .unwrap_or_else(|_| "missing".to_string());
            line.push_str(&format!(" -> {output} ({size})"));
        }
        if let Some(error) = &file.error_message {
            line.push_str(&format!("  [{error}]"));
        }
        if file.retry_count > 0 {
            line.push_str(&format!("  retries: {}", file.retry_count));
        }
        println!("{line}");
    }
}

fn status_label(status: BatchStatus) -> String {
    match status {
        BatchStatus::Completed => style(status.as_str()).green().to_string(),
        BatchStatus::Paused => style(status.as_str()).yellow().to_string(),
        _ => status.as_str().to_string(),
    }
}
