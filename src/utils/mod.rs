use anyhow::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::pipeline::is_media_file;

/// Format file size in human-readable format
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log10() / THRESHOLD.log10()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);

    let size = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Format duration in human-readable format
pub fn format_duration(seconds: f64) -> String {
    let total_seconds = seconds.max(0.0) as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Subtitle timestamp `HH:MM:SS<sep>mmm` (`,` for SRT, `.` for WebVTT)
pub fn format_timestamp(seconds: f64, separator: char) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis % 3_600_000) / 60_000;
    let secs = (total_millis % 60_000) / 1000;
    let millis = total_millis % 1000;

    format!("{:02}:{:02}:{:02}{}{:03}", hours, minutes, secs, separator, millis)
}

/// Turn command line paths into batch sources.
///
/// Every path must be an existing media file. Paths are made absolute so a batch
/// can be resumed from another working directory; duplicates are dropped.
pub fn collect_sources(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut sources = Vec::new();

    for path in paths {
        check_file_accessible(path)?;
        if !is_media_file(path) {
            anyhow::bail!("Unsupported file type: {}", path.display());
        }

        let absolute = path
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("Cannot access file {}: {}", path.display(), e))?;
        let source = absolute.display().to_string();
        if seen.insert(source.clone()) {
            sources.push(source);
        } else {
            tracing::debug!("Ignoring duplicate source {}", source);
        }
    }

    if sources.is_empty() {
        anyhow::bail!("No input files given");
    }
    Ok(sources)
}

/// Check if a file exists and is readable
pub fn check_file_accessible(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("File does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("Path is not a file: {}", path.display());
    }

    std::fs::metadata(path)
        .map_err(|e| anyhow::anyhow!("Cannot access file {}: {}", path.display(), e))?;

    Ok(())
}

/// External tools the configured pipeline needs but cannot find
pub async fn check_dependencies(config: &AppConfig) -> Vec<String> {
    let mut missing = Vec::new();

    if !check_command_available(&config.converter.ffmpeg, "-version").await {
        missing.push(format!(
            "{} - required to convert video files",
            config.converter.ffmpeg
        ));
    }

    if !check_command_available(&config.converter.ffprobe, "-version").await {
        missing.push(format!(
            "{} - used to read media durations",
            config.converter.ffprobe
        ));
    }

    if config.transcriber.program.is_empty() {
        missing.push("transcriber.program - not configured".to_string());
    }

    missing
}

/// Check if a command is available in PATH
async fn check_command_available(command: &str, version_flag: &str) -> bool {
    use tokio::process::Command;

    Command::new(command)
        .arg(version_flag)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}
