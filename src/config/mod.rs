use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::{BatchSettings, OutputFormat};
use crate::pipeline::orchestrator::OrchestratorOptions;
use crate::writer::WriterOptions;

const APP_DIR: &str = "batchscribe";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub workers: WorkerLimits,
    pub writer: WriterConfig,
    pub retry: RetryConfig,
    pub history: HistoryConfig,
    pub converter: ConverterConfig,
    pub transcriber: TranscriberConfig,
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Application data directory; batches live in `<data_dir>/batches`
    pub data_dir: Option<PathBuf>,
}

/// Allowed range for `max_concurrent_workers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLimits {
    pub min: usize,
    pub max: usize,
    pub default: usize,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            default: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub min_interval_ms: u64,
    pub queue_capacity: usize,
    pub flush_timeout_secs: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            queue_capacity: 64,
            flush_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub auto_retries: u32,
    pub max_manual_retries: u32,
    pub backoff_scale: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_retries: 1,
            max_manual_retries: 3,
            backoff_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Completed batches older than this are removed by `history cleanup`
    pub retention_days: u32,
    /// Also run the cleanup on every start
    pub cleanup_on_start: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            cleanup_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub bitrate: String,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            sample_rate: 16000,
            channels: 1,
            bitrate: "64k".to_string(),
        }
    }
}

/// External speech-to-text command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: vec!["{input}".to_string()],
        }
    }
}

/// Settings applied to new batches unless overridden on the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub output_format: OutputFormat,
    pub output_dir: Option<String>,
    pub language: String,
    pub diarize: bool,
    pub smart_format: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Txt,
            output_dir: None,
            language: "en".to_string(),
            diarize: false,
            smart_format: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file is created with defaults. Returns the config and where it lives.
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        if config_path.exists() {
            let content =
                fs_err::read_to_string(&config_path).context("Failed to read config file")?;

            let config: AppConfig =
                serde_yaml::from_str(&content).context("Failed to parse config file")?;

            config.validate()?;
            Ok((config, config_path))
        } else {
            let config = Self::default();
            config.save(&config_path)?;
            tracing::info!("Created default config at {}", config_path.display());
            Ok((config, config_path))
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs_err::write(path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// `./batchscribe.yaml` when present, else the per-user config directory
    pub fn default_path() -> Result<PathBuf> {
        let local_config = PathBuf::from("batchscribe.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join(APP_DIR).join("config.yaml"))
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.workers;
        if w.min == 0 {
            anyhow::bail!("workers.min must be at least 1");
        }
        if w.min > w.max {
            anyhow::bail!("workers.min ({}) is greater than workers.max ({})", w.min, w.max);
        }
        if !(w.min..=w.max).contains(&w.default) {
            anyhow::bail!(
                "workers.default ({}) must be between {} and {}",
                w.default,
                w.min,
                w.max
            );
        }

        if self.writer.queue_capacity == 0 {
            anyhow::bail!("writer.queue_capacity must be at least 1");
        }

        if !self.retry.backoff_scale.is_finite() || self.retry.backoff_scale < 0.0 {
            anyhow::bail!("retry.backoff_scale must be a non-negative number");
        }

        if self.converter.sample_rate == 0 || self.converter.channels == 0 {
            anyhow::bail!("converter.sample_rate and converter.channels must be positive");
        }

        if self.defaults.language.trim().is_empty() {
            anyhow::bail!("defaults.language must not be empty");
        }

        Ok(())
    }

    /// Check a requested worker count against the configured range
    pub fn validate_workers(&self, requested: Option<usize>) -> Result<usize> {
        let workers = requested.unwrap_or(self.workers.default);
        if !(self.workers.min..=self.workers.max).contains(&workers) {
            anyhow::bail!(
                "Worker count {} is out of range ({}-{})",
                workers,
                self.workers.min,
                self.workers.max
            );
        }
        Ok(workers)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::data_dir()
                .context("Could not determine data directory")?
                .join(APP_DIR)),
        }
    }

    /// Settings for a new batch, starting from the configured defaults
    pub fn batch_settings(&self, workers: usize) -> BatchSettings {
        BatchSettings {
            output_format: self.defaults.output_format,
            output_dir: self.defaults.output_dir.clone(),
            language: self.defaults.language.clone(),
            diarize: self.defaults.diarize,
            smart_format: self.defaults.smart_format,
            max_concurrent_workers: workers,
        }
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            min_interval: Duration::from_millis(self.writer.min_interval_ms),
            queue_capacity: self.writer.queue_capacity,
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.writer.flush_timeout_secs)
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            auto_retries: self.retry.auto_retries,
            max_manual_retries: self.retry.max_manual_retries,
            backoff_scale: self.retry.backoff_scale,
            flush_timeout: self.flush_timeout(),
        }
    }

    /// Display current configuration
    pub fn display(&self, path: &Path) {
        println!("Current Configuration ({}):", path.display());
        match self.data_dir() {
            Ok(dir) => println!("  Data Dir: {}", dir.display()),
            Err(e) => println!("  Data Dir: <unavailable: {}>", e),
        }
        println!(
            "  Workers: {} (allowed {}-{})",
            self.workers.default, self.workers.min, self.workers.max
        );
        println!(
            "  Writer: every {}ms, queue {}, flush timeout {}s",
            self.writer.min_interval_ms, self.writer.queue_capacity, self.writer.flush_timeout_secs
        );
        println!(
            "  Retries: {} automatic, {} manual, backoff x{}",
            self.retry.auto_retries, self.retry.max_manual_retries, self.retry.backoff_scale
        );
        println!(
            "  History: keep {} days{}",
            self.history.retention_days,
            if self.history.cleanup_on_start { ", cleaned on start" } else { "" }
        );
        println!(
            "  Converter: {} ({} Hz, {} ch, {})",
            self.converter.ffmpeg,
            self.converter.sample_rate,
            self.converter.channels,
            self.converter.bitrate
        );
        if self.transcriber.program.is_empty() {
            println!("  Transcriber: <not configured>");
        } else {
            println!(
                "  Transcriber: {} {}",
                self.transcriber.program,
                self.transcriber.args.join(" ")
            );
        }
        println!(
            "  Defaults: {} / {} / diarize={} / smart_format={}",
            self.defaults.output_format,
            self.defaults.language,
            self.defaults.diarize,
            self.defaults.smart_format
        );
        if let Some(dir) = &self.defaults.output_dir {
            println!("  Output Dir: {}", dir);
        }
    }
}
