use anyhow::Context;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;

use super::MediaConverter;
use crate::config::ConverterConfig;
use crate::Result;

/// Extracts a mono MP3 track from video sources with ffmpeg.
///
/// Converted audio lives in a scratch directory owned by the converter and is
/// removed with it.
pub struct FfmpegConverter {
    config: ConverterConfig,
    scratch: TempDir,
}

impl FfmpegConverter {
    pub fn new(config: ConverterConfig) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("batchscribe-audio-")
            .tempdir()
            .context("Failed to create scratch directory for converted audio")?;

        Ok(Self { config, scratch })
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    fn target_for(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];

        self.scratch.path().join(format!("{stem}_{suffix}.mp3"))
    }
}

#[async_trait]
impl MediaConverter for FfmpegConverter {
    async fn convert(&self, source: &Path) -> Result<PathBuf> {
        if !source.exists() {
            anyhow::bail!("File not found: {}", source.display());
        }

        let target = self.target_for(source);
        tracing::debug!("Converting {} -> {}", source.display(), target.display());

        let output = Command::new(&self.config.ffmpeg)
            .arg("-i")
            .arg(source)
            .args([
                "-vn",
                "-acodec",
                "libmp3lame",
                "-ar",
                &self.config.sample_rate.to_string(),
                "-ac",
                &self.config.channels.to_string(),
                "-b:a",
                &self.config.bitrate,
                "-y",
            ])
            .arg(&target)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => anyhow::anyhow!(
                    "FFmpeg not found ({}). Please reinstall ffmpeg or fix converter.ffmpeg",
                    self.config.ffmpeg
                ),
                ErrorKind::PermissionDenied => {
                    anyhow::anyhow!("Permission denied running {}", self.config.ffmpeg)
                }
                _ => anyhow::Error::new(e).context("Failed to start ffmpeg"),
            })?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            // ffmpeg prints its banner first; the cause is on the last lines
            let tail: Vec<&str> = error.lines().rev().take(3).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            anyhow::bail!("Failed to convert file with ffmpeg: {}", tail.join(" "));
        }

        Ok(target)
    }

    async fn cleanup(&self, audio: &Path) {
        match tokio::fs::remove_file(audio).await {
            Ok(()) => tracing::debug!("Removed temporary audio {}", audio.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove temporary audio {}: {}", audio.display(), e),
        }
    }
}

/// Media duration in seconds as reported by ffprobe
pub async fn probe_duration(ffprobe: &str, path: &Path) -> Result<Option<f64>> {
    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .output()
        .await
        .with_context(|| format!("Failed to run {ffprobe}"))?;

    if !output.status.success() {
        let error = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Failed to analyze file with ffprobe: {}", error);
    }

    let info: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    Ok(info["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok()))
}
