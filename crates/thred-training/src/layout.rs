use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Filesystem layout of a model directory.
///
/// ```text
/// <model_dir>/
///   run_config.toml
///   checkpoint.json        # checkpoint manifest
///   ckpt-<step>.*          # checkpoint files
///   log_<unix_ts>          # run log
///   train_log/events.jsonl # scalar summaries
///   best_dev_ppl/          # best checkpoint by dev perplexity
/// ```
#[derive(Debug, Clone)]
pub struct ModelLayout {
    root: PathBuf,
}

impl ModelLayout {
    pub const CHECKPOINT_PREFIX: &'static str = "ckpt";

    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(crate::config::RunConfig::FILE_NAME)
    }

    /// Prefix handed to the train context; it appends `-<step>` and an extension.
    #[must_use]
    pub fn checkpoint_prefix(&self) -> PathBuf {
        self.root.join(Self::CHECKPOINT_PREFIX)
    }

    #[must_use]
    pub fn best_dev_ppl_dir(&self) -> PathBuf {
        self.root.join("best_dev_ppl")
    }

    #[must_use]
    pub fn summary_dir(&self) -> PathBuf {
        self.root.join("train_log")
    }

    #[must_use]
    pub fn log_path(&self, unix_ts: i64) -> PathBuf {
        self.root.join(format!("log_{unix_ts}"))
    }

    #[must_use]
    pub fn decode_output_path(&self, label: &str) -> PathBuf {
        self.root.join(format!("{label}.out"))
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.best_dev_ppl_dir())?;
        std::fs::create_dir_all(self.summary_dir())?;
        Ok(())
    }
}
