//! Append-only run log.
//!
//! Every line is also emitted through `tracing`, so the console and the log
//! file carry the same record.

use crate::error::TrainingResult;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn open(path: &Path) -> TrainingResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), file })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logs a line. A failed file write is reported but never interrupts training.
    pub fn print(&mut self, line: &str) {
        info!("{line}");
        if let Err(e) = writeln!(self.file, "{line}") {
            warn!(path = %self.path.display(), error = %e, "Failed to append to run log");
        }
    }

    pub fn print_time(&mut self, line: &str, start: Instant) {
        self.print(&format!(
            "{}, time {:.2}s, {}",
            line,
            start.elapsed().as_secs_f64(),
            chrono::Local::now().format("%a %b %e %T %Y")
        ));
    }

    pub fn flush(&mut self) -> TrainingResult<()> {
        self.file.flush()?;
        Ok(())
    }
}
