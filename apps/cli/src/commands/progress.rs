//! Terminal progress for training runs.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use thred_training::{ProgressEvent, ProgressSink};

/// Renders training progress as a bar (or a spinner when the step budget is unknown).
pub struct BarProgressSink {
    bar: ProgressBar,
}

impl BarProgressSink {
    pub fn new(hidden: bool) -> Self {
        let bar = if hidden { ProgressBar::hidden() } else { ProgressBar::new_spinner() };
        Self { bar }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} step {pos} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl ProgressSink for BarProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { global_step, total_steps, epoch, num_epochs, .. } => {
                if total_steps > 0 {
                    self.bar.set_length(total_steps);
                    self.bar.set_style(bar_style());
                } else {
                    self.bar.set_style(spinner_style());
                }
                self.bar.set_position(global_step);
                self.bar.set_message(format!("epoch {epoch}/{num_epochs}"));
                self.bar.enable_steady_tick(Duration::from_millis(100));
            }
            ProgressEvent::Epoch { epoch, num_epochs, .. } => {
                self.bar.set_message(format!("epoch {epoch}/{num_epochs}"));
            }
            ProgressEvent::Stats { global_step, train_ppl, best_dev_ppl, words_per_sec_k, .. } => {
                self.bar.set_position(global_step);
                self.bar.set_message(format!(
                    "ppl {} best dev {} {:.1}K wps",
                    format!("{train_ppl:.2}").cyan(),
                    format!("{best_dev_ppl:.2}").green(),
                    words_per_sec_k
                ));
            }
            ProgressEvent::Finished { global_step, .. } => {
                self.bar.set_position(global_step);
                self.bar.finish_and_clear();
            }
        }
    }
}
