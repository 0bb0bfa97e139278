use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::batch::FileState;
use crate::pipeline::{EventExtra, ProgressObserver, Stage};

/// Renders orchestrator events as a progress bar with one line per finished file
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new(total: usize, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::hidden())
        } else {
            ProgressBar::new(total as u64)
        };

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.bar.finish_with_message(message.into());
    }

    fn advance(&self) {
        // Retried files finish twice
        if self.bar.position() >= self.bar.length().unwrap_or(0) {
            self.bar.inc_length(1);
        }
        self.bar.inc(1);
    }
}

impl ProgressObserver for TerminalProgress {
    fn on_event(&self, stage: Stage, file: &FileState, extra: &EventExtra) {
        match stage {
            Stage::Converting | Stage::Transcribing | Stage::Saving => {
                self.bar.set_message(format!("{} {}", stage, file.name()));
            }
            Stage::Completed => {
                self.advance();
                let target = extra.get("output_path").map(String::as_str).unwrap_or("");
                self.bar.println(format!(
                    "{} {} {}",
                    style("✓").green(),
                    file.name(),
                    style(target).dim()
                ));
            }
            Stage::Failed => {
                self.advance();
                let error = extra.get("error").map(String::as_str).unwrap_or("unknown error");
                self.bar.println(format!("{} {}: {}", style("✗").red(), file.name(), error));
            }
        }
    }
}
