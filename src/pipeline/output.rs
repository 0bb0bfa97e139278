use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{OutputWriter, Transcript};
use crate::batch::OutputFormat;
use crate::utils::format_timestamp;
use crate::Result;

/// Writes `<stem>.<ext>` into the output directory, or next to the source
pub struct TextOutputWriter;

impl TextOutputWriter {
    pub fn new() -> Self {
        Self
    }

    /// Where the transcript of `source` ends up
    pub fn target_path(source: &Path, format: OutputFormat, output_dir: Option<&Path>) -> PathBuf {
        let dir = output_dir
            .map(Path::to_path_buf)
            .or_else(|| source.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "transcript".to_string());

        dir.join(format!("{}.{}", stem, format.extension()))
    }
}

impl Default for TextOutputWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutputWriter for TextOutputWriter {
    async fn save(
        &self,
        transcript: &Transcript,
        source: &Path,
        format: OutputFormat,
        output_dir: Option<&Path>,
    ) -> Result<PathBuf> {
        let path = Self::target_path(source, format, output_dir);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Cannot access file {}", parent.display()))?;
        }

        tokio::fs::write(&path, render(transcript, format))
            .await
            .with_context(|| format!("Failed to write transcript to {}", path.display()))?;

        tracing::debug!("Saved transcript to {}", path.display());
        Ok(path)
    }
}

/// Subtitle formats get a single cue spanning the whole recording
fn render(transcript: &Transcript, format: OutputFormat) -> String {
    let text = transcript.text.trim();
    let end = transcript.duration_seconds.unwrap_or(0.0);

    match format {
        OutputFormat::Txt => format!("{text}\n"),
        OutputFormat::Srt => format!(
            "1\n{} --> {}\n{}\n",
            format_timestamp(0.0, ','),
            format_timestamp(end, ','),
            text
        ),
        OutputFormat::Vtt => format!(
            "WEBVTT\n\n{} --> {}\n{}\n",
            format_timestamp(0.0, '.'),
            format_timestamp(end, '.'),
            text
        ),
    }
}
