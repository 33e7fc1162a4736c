use crate::error::{TrainingError, TrainingResult};
use crate::layout::ModelLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Identifier for a training run. Survives resumption.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Hyperparameters plus training progress for one run.
///
/// The same record is read from a user-supplied hyperparameter file on a fresh
/// start and from `<model_dir>/run_config.toml` on resume. It is the only
/// state needed to pick up an interrupted run: the training loop rewrites it
/// after every epoch and every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub model_dir: PathBuf,
    pub train_data: PathBuf,
    pub dev_data: PathBuf,
    pub test_data: PathBuf,

    /// Current epoch, zero based.
    pub epoch: u32,
    /// Steps completed inside the current epoch.
    pub epoch_step: u64,
    pub num_train_epochs: u32,
    /// Expected total steps; only used for progress reporting.
    pub num_train_steps: u64,
    pub batch_size: u32,
    pub learning_rate: f64,

    pub num_turns: u32,
    /// Turns used while pretraining; 0 disables pretraining.
    pub num_pretrain_turns: u32,

    pub steps_per_stats: u64,
    pub steps_per_eval: u64,

    /// Maximum patience; restored whenever dev perplexity improves.
    pub patience: u32,
    /// Remaining patience. `None` means untouched, i.e. equal to `patience`.
    pub patience_left: Option<u32>,
    pub best_dev_ppl: f64,
    pub degrade_threshold: f64,
    /// Number of dev batches, filled in when training starts.
    pub dev_size: u64,

    pub beam_width: u32,
    pub length_penalty_weight: f64,
    pub sampling_temperature: f64,
    pub n_responses: u32,
    pub infer_batch_size: u32,
    pub max_decode_len: u32,
    /// Whether sample decoding reads the first beam entry when beam search is on.
    pub consider_beam: bool,
    /// Score the best checkpoint on the test set once training ends.
    pub eval_best_model: bool,

    pub max_checkpoints_to_keep: usize,
    pub random_seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            created_at: now,
            updated_at: now,
            model_dir: PathBuf::from("model"),
            train_data: PathBuf::new(),
            dev_data: PathBuf::new(),
            test_data: PathBuf::new(),
            epoch: 0,
            epoch_step: 0,
            num_train_epochs: 10,
            num_train_steps: 0,
            batch_size: 32,
            learning_rate: 1.0,
            num_turns: 2,
            num_pretrain_turns: 0,
            steps_per_stats: 100,
            steps_per_eval: 1000,
            patience: 5,
            patience_left: None,
            best_dev_ppl: f64::INFINITY,
            degrade_threshold: 1.05,
            dev_size: 0,
            beam_width: 0,
            length_penalty_weight: 0.0,
            sampling_temperature: 0.0,
            n_responses: 1,
            infer_batch_size: 32,
            max_decode_len: 30,
            consider_beam: true,
            eval_best_model: false,
            max_checkpoints_to_keep: 5,
            random_seed: None,
        }
    }
}

impl RunConfig {
    pub const FILE_NAME: &'static str = "run_config.toml";

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Starts from `fresh`, unless its model directory already holds a
    /// persisted run, in which case that run is resumed.
    ///
    /// The resumed run always lives where it was found, even if the directory
    /// was moved since it was last saved.
    pub fn resume_or(fresh: Self) -> TrainingResult<Self> {
        let persisted = ModelLayout::new(fresh.model_dir.clone()).config_path();
        if !persisted.exists() {
            return Ok(fresh);
        }

        let mut resumed = Self::load(&persisted)?;
        resumed.model_dir = fresh.model_dir;
        info!(
            run_id = %resumed.run_id,
            epoch = resumed.epoch,
            epoch_step = resumed.epoch_step,
            path = %persisted.display(),
            "Resuming persisted run"
        );
        Ok(resumed)
    }

    /// Writes the record to `<model_dir>/run_config.toml`.
    pub fn save(&mut self) -> TrainingResult<()> {
        self.updated_at = Utc::now();
        let path = self.layout().config_path();
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> TrainingResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    #[must_use]
    pub fn layout(&self) -> ModelLayout {
        ModelLayout::new(self.model_dir.clone())
    }

    #[must_use]
    pub fn is_pretrain_enabled(&self) -> bool {
        self.num_pretrain_turns > 0
    }

    #[must_use]
    pub fn patience_left(&self) -> u32 {
        self.patience_left.unwrap_or(self.patience)
    }

    pub fn reset_patience(&mut self) {
        self.patience_left = Some(self.patience);
    }

    pub fn decrement_patience(&mut self) {
        self.patience_left = Some(self.patience_left().saturating_sub(1));
    }

    /// Sets a new epoch budget. Raising the budget of a run that stopped on
    /// patience restores full patience, otherwise the extra epochs never run.
    pub fn extend_epochs(&mut self, num_train_epochs: u32) {
        if num_train_epochs > self.num_train_epochs && self.patience_left() == 0 {
            info!(
                run_id = %self.run_id,
                from = self.num_train_epochs,
                to = num_train_epochs,
                patience = self.patience,
                "Epoch budget raised; restoring patience"
            );
            self.reset_patience();
        }
        self.num_train_epochs = num_train_epochs;
    }

    /// Whether sample decoding should expect beam output.
    #[must_use]
    pub fn uses_beam(&self) -> bool {
        self.beam_width > 0 && self.consider_beam
    }

    /// File stem of the test set, used to label decode outputs.
    #[must_use]
    pub fn test_name(&self) -> String {
        self.test_data
            .file_stem()
            .map_or_else(|| "test".to_string(), |s| s.to_string_lossy().to_string())
    }

    pub fn validate_for_train(&self) -> TrainingResult<()> {
        if self.num_turns < 2 {
            return Err(TrainingError::Precondition(format!(
                "num_turns must be >= 2 (got {})",
                self.num_turns
            )));
        }
        if self.is_pretrain_enabled() {
            if self.num_pretrain_turns < 2 {
                return Err(TrainingError::Precondition(format!(
                    "num_pretrain_turns must be >= 2 when pretraining (got {})",
                    self.num_pretrain_turns
                )));
            }
            if self.num_turns < self.num_pretrain_turns {
                return Err(TrainingError::Precondition(format!(
                    "num_turns ({}) must be >= num_pretrain_turns ({})",
                    self.num_turns, self.num_pretrain_turns
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(TrainingError::Precondition("batch_size must be >= 1".to_string()));
        }
        if self.steps_per_stats == 0 || self.steps_per_eval == 0 {
            return Err(TrainingError::Precondition(
                "steps_per_stats and steps_per_eval must be >= 1".to_string(),
            ));
        }
        if self.patience == 0 {
            return Err(TrainingError::Precondition("patience must be >= 1".to_string()));
        }
        if !self.degrade_threshold.is_finite() || self.degrade_threshold <= 0.0 {
            return Err(TrainingError::Precondition("degrade_threshold must be > 0".to_string()));
        }
        if self.train_data.as_os_str().is_empty() || self.dev_data.as_os_str().is_empty() {
            return Err(TrainingError::Precondition(
                "train_data and dev_data are required".to_string(),
            ));
        }
        if self.eval_best_model {
            self.validate_for_test()?;
        }
        Ok(())
    }

    pub fn validate_for_test(&self) -> TrainingResult<()> {
        if self.n_responses < 1 {
            return Err(TrainingError::Precondition("n_responses must be >= 1".to_string()));
        }
        if self.beam_width > 0 {
            if self.n_responses > self.beam_width {
                return Err(TrainingError::Precondition(format!(
                    "n_responses ({}) must be <= beam_width ({})",
                    self.n_responses, self.beam_width
                )));
            }
        } else if self.n_responses != 1 {
            return Err(TrainingError::Precondition(format!(
                "n_responses must be 1 without beam search (got {})",
                self.n_responses
            )));
        }
        if self.infer_batch_size == 0 {
            return Err(TrainingError::Precondition("infer_batch_size must be >= 1".to_string()));
        }
        if self.test_data.as_os_str().is_empty() {
            return Err(TrainingError::Precondition("test_data is required".to_string()));
        }
        Ok(())
    }
}
