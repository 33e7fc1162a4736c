//! Structured scalar summaries, one JSON object per line.

use crate::error::TrainingResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub tag: String,
    pub value: f64,
}

/// Scalars produced together, e.g. by one training step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub scalars: Vec<Scalar>,
}

impl Summary {
    #[must_use]
    pub fn scalar(tag: impl Into<String>, value: f64) -> Self {
        Self { scalars: vec![Scalar { tag: tag.into(), value }] }
    }

    #[must_use]
    pub fn with(mut self, tag: impl Into<String>, value: f64) -> Self {
        self.scalars.push(Scalar { tag: tag.into(), value });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub step: u64,
    pub tag: String,
    pub value: f64,
    pub wall_time: f64,
}

pub trait SummaryWriter {
    fn add_summary(&mut self, step: u64, summary: &Summary) -> TrainingResult<()>;

    fn add_scalar(&mut self, step: u64, tag: &str, value: f64) -> TrainingResult<()> {
        self.add_summary(step, &Summary::scalar(tag, value))
    }

    fn close(&mut self) -> TrainingResult<()>;
}

/// Appends summaries to `<dir>/events.jsonl`.
pub struct JsonlSummaryWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
}

impl JsonlSummaryWriter {
    pub const FILE_NAME: &'static str = "events.jsonl";

    pub fn create(dir: &Path) -> TrainingResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, out: Some(BufWriter::new(file)) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SummaryWriter for JsonlSummaryWriter {
    fn add_summary(&mut self, step: u64, summary: &Summary) -> TrainingResult<()> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        let wall_time = Utc::now().timestamp_millis() as f64 / 1000.0;
        // JSON has no representation for inf/NaN
        for scalar in summary.scalars.iter().filter(|s| s.value.is_finite()) {
            let event =
                SummaryEvent { step, tag: scalar.tag.clone(), value: scalar.value, wall_time };
            serde_json::to_writer(&mut *out, &event)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn close(&mut self) -> TrainingResult<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        Ok(())
    }
}

impl Drop for JsonlSummaryWriter {
    fn drop(&mut self) {
        if let Some(out) = self.out.as_mut() {
            let _ = out.flush();
        }
    }
}
