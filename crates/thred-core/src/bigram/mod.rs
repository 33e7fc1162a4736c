//! Word bigram backend.
//!
//! Checkpoints are single JSON files (`ckpt-<step>.json`) holding the
//! vocabulary and sparse transition weights. Each training step adds
//! `learning_rate` to every transition observed in the batch.

mod contexts;
mod model;

pub use contexts::{BigramEvalContext, BigramInferContext, BigramTrainContext};
pub use model::{BOS, BigramCheckpoint, BigramModel, EOS, Score, UNK, context_of, length_penalty};

use thred_training::{ModelFactory, RunConfig, TrainingError, TrainingResult};
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
pub struct BigramModelFactory;

impl ModelFactory for BigramModelFactory {
    type Train = BigramTrainContext;
    type Eval = BigramEvalContext;
    type Infer = BigramInferContext;

    fn prepare(&self, config: &RunConfig) -> TrainingResult<()> {
        if config.max_decode_len == 0 {
            return Err(TrainingError::Precondition("max_decode_len must be >= 1".to_string()));
        }
        info!(
            model_dir = %config.model_dir.display(),
            num_turns = config.num_turns,
            "Preparing bigram backend"
        );
        Ok(())
    }

    fn create_train(&self, config: &RunConfig) -> TrainingResult<BigramTrainContext> {
        BigramTrainContext::new(config)
    }

    fn create_eval(&self, _config: &RunConfig) -> TrainingResult<BigramEvalContext> {
        Ok(BigramEvalContext::new())
    }

    fn create_infer(&self, config: &RunConfig) -> TrainingResult<BigramInferContext> {
        Ok(BigramInferContext::new(config))
    }
}
