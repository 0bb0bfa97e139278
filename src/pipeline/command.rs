use anyhow::Context;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use tokio::process::Command;

use super::ffmpeg::probe_duration;
use super::{TranscribeOptions, Transcriber, Transcript};
use crate::config::TranscriberConfig;
use crate::Result;

/// Runs an external speech-to-text program once per file.
///
/// Arguments may contain `{input}`, `{language}`, `{diarize}` and `{smart_format}`
/// placeholders. Whatever the program prints on stdout is the transcript.
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
    ffprobe: Option<String>,
}

impl CommandTranscriber {
    pub fn new(config: &TranscriberConfig, ffprobe: Option<String>) -> Result<Self> {
        if config.program.trim().is_empty() {
            anyhow::bail!(
                "No transcriber configured. Set transcriber.program in the config file"
            );
        }

        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            ffprobe,
        })
    }

    fn expand_args(&self, audio: &Path, options: &TranscribeOptions) -> Vec<String> {
        let input = audio.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{language}", &options.language)
                    .replace("{diarize}", &options.diarize.to_string())
                    .replace("{smart_format}", &options.smart_format.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, audio: &Path, options: &TranscribeOptions) -> Result<Transcript> {
        if !audio.is_file() {
            anyhow::bail!("File does not exist: {}", audio.display());
        }

        let args = self.expand_args(audio, options);
        tracing::debug!("Running {} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => anyhow::anyhow!(
                    "Transcriber program not found: {}. Please reinstall it or fix transcriber.program",
                    self.program
                ),
                _ => anyhow::Error::new(e).context(format!("Failed to start {}", self.program)),
            })?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Transcription failed ({}): {}",
                output.status,
                error.trim()
            );
        }

        let text = String::from_utf8(output.stdout)
            .context("Transcriber produced output that is not valid UTF-8")?;

        let duration_seconds = match &self.ffprobe {
            Some(ffprobe) => probe_duration(ffprobe, audio).await.unwrap_or_else(|e| {
                tracing::debug!("Could not read duration of {}: {:#}", audio.display(), e);
                None
            }),
            None => None,
        };

        Ok(Transcript {
            text: text.trim().to_string(),
            duration_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> TranscribeOptions {
        TranscribeOptions {
            language: "de".to_string(),
            diarize: true,
            smart_format: false,
        }
    }

    fn config(program: &str, args: &[&str]) -> TranscriberConfig {
        TranscriberConfig {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_requires_program() {
        assert!(CommandTranscriber::new(&config("  ", &[]), None).is_err());
    }

    #[test]
    fn test_expand_args() {
        let t = CommandTranscriber::new(
            &config("stt", &["--in={input}", "-l", "{language}", "--diarize={diarize}", "{smart_format}"]),
            None,
        )
        .unwrap();

        let args = t.expand_args(Path::new("/tmp/a.mp3"), &options());
        assert_eq!(args, vec!["--in=/tmp/a.mp3", "-l", "de", "--diarize=true", "false"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_is_the_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("a.mp3");
        fs_err::write(&audio, b"hello from the file\n").unwrap();

        let t = CommandTranscriber::new(&config("cat", &["{input}"]), None).unwrap();
        let transcript = t.transcribe(&audio, &options()).await.unwrap();

        assert_eq!(transcript.text, "hello from the file");
        assert_eq!(transcript.duration_seconds, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("a.mp3");
        fs_err::write(&audio, b"x").unwrap();

        let t = CommandTranscriber::new(
            &config("sh", &["-c", "echo 'HTTP 503 service unavailable' >&2; exit 3"]),
            None,
        )
        .unwrap();
        let err = t.transcribe(&audio, &options()).await.unwrap_err();

        assert!(crate::classify::is_retryable(&err.to_string()));
    }

    #[tokio::test]
    async fn test_missing_audio() {
        let t = CommandTranscriber::new(&config("cat", &["{input}"]), None).unwrap();
        let err = t
            .transcribe(Path::new("/nope/a.mp3"), &options())
            .await
            .unwrap_err();

        assert!(!crate::classify::is_retryable(&err.to_string()));
    }
}
