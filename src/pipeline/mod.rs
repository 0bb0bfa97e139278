//! The fixed convert -> transcribe -> save pipeline and the collaborators it calls.
//!
//! The orchestrator only knows these traits. Concrete implementations used by the
//! command line tool live in [`ffmpeg`], [`command`] and [`output`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::batch::{FileState, OutputFormat};
use crate::Result;

pub mod command;
pub mod ffmpeg;
pub mod orchestrator;
pub mod output;

pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "m4a", "ogg", "wma", "aac"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov", "wmv", "webm", "flv"];

/// Whether a source can go straight to the transcriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }

    pub fn needs_conversion(&self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .is_some_and(|e| AUDIO_EXTENSIONS.contains(&e.as_str()) || VIDEO_EXTENSIONS.contains(&e.as_str()))
}

/// Options passed to the transcriber, taken from the batch settings
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeOptions {
    pub language: String,
    pub diarize: bool,
    pub smart_format: bool,
}

/// What the transcriber hands back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub duration_seconds: Option<f64>,
}

/// Turns a video source into an audio file the transcriber accepts
#[async_trait]
pub trait MediaConverter: Send + Sync {
    async fn convert(&self, source: &Path) -> Result<PathBuf>;

    /// Remove an audio file produced by [`MediaConverter::convert`]
    async fn cleanup(&self, _audio: &Path) {}
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path, options: &TranscribeOptions) -> Result<Transcript>;
}

/// Persists a transcript next to its source (or into `output_dir`)
#[async_trait]
pub trait OutputWriter: Send + Sync {
    async fn save(
        &self,
        transcript: &Transcript,
        source: &Path,
        format: OutputFormat,
        output_dir: Option<&Path>,
    ) -> Result<PathBuf>;
}

/// Pipeline stage reported to the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Converting,
    Transcribing,
    Saving,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Converting => "converting",
            Stage::Transcribing => "transcribing",
            Stage::Saving => "saving",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type EventExtra = BTreeMap<String, String>;

/// Progress sink for a presentation layer
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, stage: Stage, file: &FileState, extra: &EventExtra);
}

/// The three collaborators the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub converter: std::sync::Arc<dyn MediaConverter>,
    pub transcriber: std::sync::Arc<dyn Transcriber>,
    pub writer: std::sync::Arc<dyn OutputWriter>,
}
