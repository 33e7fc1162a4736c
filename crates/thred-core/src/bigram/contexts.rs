use super::model::{BigramCheckpoint, BigramModel, context_of};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thred_training::{
    Checkpoint, ContextKind, DecodeOptions, Decoded, DialogueExample, EvalContext,
    ExecutionContext, InferContext, InferOutput, RunConfig, StepOutcome, StepStats, Summary,
    TrainContext, TrainingError, TrainingResult, load_dialogues,
};
use tracing::debug;

/// Loads the model stored in `checkpoint`, or a fresh one.
fn load_model(checkpoint: Option<&Checkpoint>) -> TrainingResult<(BigramModel, u64)> {
    let Some(checkpoint) = checkpoint else {
        return Ok((BigramModel::new(), 0));
    };
    let path = checkpoint
        .paths()
        .into_iter()
        .find(|p| p.extension().is_some_and(|ext| ext == "json"))
        .ok_or_else(|| {
            TrainingError::Checkpoint(format!(
                "checkpoint at step {} has no bigram weights",
                checkpoint.global_step
            ))
        })?;
    let ckpt = BigramCheckpoint::load(&path)?;
    let step = ckpt.global_step;
    Ok((BigramModel::from_checkpoint(ckpt)?, step))
}

pub struct BigramTrainContext {
    model: BigramModel,
    examples: Vec<DialogueExample>,
    cursor: usize,
    batch_size: usize,
    learning_rate: f64,
    global_step: u64,
}

impl BigramTrainContext {
    pub fn new(config: &RunConfig) -> TrainingResult<Self> {
        let examples = load_dialogues(&config.train_data)?;
        if examples.is_empty() {
            return Err(TrainingError::Dataset(format!(
                "train set {} has no examples",
                config.train_data.display()
            )));
        }
        Ok(Self {
            model: BigramModel::new(),
            examples,
            cursor: 0,
            batch_size: config.batch_size.max(1) as usize,
            learning_rate: config.learning_rate,
            global_step: 0,
        })
    }
}

impl ExecutionContext for BigramTrainContext {
    fn kind(&self) -> ContextKind {
        ContextKind::Train
    }

    fn restore(&mut self, checkpoint: Option<&Checkpoint>) -> TrainingResult<u64> {
        let (model, step) = load_model(checkpoint)?;
        self.model = model;
        self.global_step = step;
        debug!(global_step = step, vocab = self.model.vocab_size(), "Restored train model");
        Ok(step)
    }

    fn close(&mut self) -> TrainingResult<()> {
        debug!(global_step = self.global_step, "Closed train context");
        Ok(())
    }
}

impl TrainContext for BigramTrainContext {
    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn reset_iterator(&mut self, skip_count: u64) -> TrainingResult<()> {
        self.cursor = usize::try_from(skip_count).unwrap_or(usize::MAX).min(self.examples.len());
        Ok(())
    }

    fn step(&mut self) -> TrainingResult<StepOutcome> {
        if self.cursor >= self.examples.len() {
            return Ok(StepOutcome::EpochExhausted);
        }
        let end = (self.cursor + self.batch_size).min(self.examples.len());
        let batch = &self.examples[self.cursor..end];
        let lr = self.learning_rate;

        // Loss is measured before the update.
        let mut nll = 0.0;
        let mut predict_count = 0;
        let mut word_count = 0;
        for example in batch {
            let score = self.model.score(example);
            nll += score.nll;
            predict_count += score.predict_count;
            word_count += example
                .sources
                .iter()
                .chain(std::iter::once(&example.target))
                .map(|turn| turn.split_whitespace().count() as u64)
                .sum::<u64>();
        }

        let mut increments: HashMap<(usize, usize), f64> = HashMap::new();
        for example in batch {
            for (prev, next) in self.model.transitions(example) {
                self.model.add(prev, next, lr);
                *increments.entry((prev, next)).or_default() += lr;
            }
        }
        let grad_norm = increments.values().map(|v| v * v).sum::<f64>().sqrt();

        let batch_size = batch.len();
        let loss = nll / batch_size as f64;
        self.cursor = end;
        self.global_step += 1;

        let summary = Summary::scalar("train_loss", loss)
            .with("vocab_size", self.model.vocab_size() as f64);
        Ok(StepOutcome::Advanced(StepStats {
            loss,
            batch_size: batch_size as u32,
            predict_count,
            word_count,
            grad_norm,
            learning_rate: lr,
            global_step: self.global_step,
            summary: Some(summary),
        }))
    }

    fn save(&mut self, prefix: &Path, global_step: u64) -> TrainingResult<Vec<PathBuf>> {
        let path = PathBuf::from(format!("{}-{}.json", prefix.display(), global_step));
        self.model.to_checkpoint(global_step).write(&path)?;
        Ok(vec![path])
    }
}

pub struct BigramEvalContext {
    model: BigramModel,
}

impl BigramEvalContext {
    #[must_use]
    pub fn new() -> Self {
        Self { model: BigramModel::new() }
    }
}

impl Default for BigramEvalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for BigramEvalContext {
    fn kind(&self) -> ContextKind {
        ContextKind::Eval
    }

    fn restore(&mut self, checkpoint: Option<&Checkpoint>) -> TrainingResult<u64> {
        let (model, step) = load_model(checkpoint)?;
        self.model = model;
        Ok(step)
    }

    fn close(&mut self) -> TrainingResult<()> {
        Ok(())
    }
}

impl EvalContext for BigramEvalContext {
    fn perplexity(&mut self, data: &Path) -> TrainingResult<f64> {
        let examples = load_dialogues(data)?;
        if examples.is_empty() {
            return Err(TrainingError::Dataset(format!("{} has no examples", data.display())));
        }
        let (nll, count) = examples.iter().map(|ex| self.model.score(ex)).fold(
            (0.0, 0u64),
            |(nll, count), score| (nll + score.nll, count + score.predict_count),
        );
        Ok((nll / count as f64).exp())
    }
}

pub struct BigramInferContext {
    model: BigramModel,
    beam_width: usize,
    length_penalty_weight: f64,
    sampling_temperature: f64,
    max_decode_len: usize,
    rng: StdRng,
}

impl BigramInferContext {
    #[must_use]
    pub fn new(config: &RunConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            model: BigramModel::new(),
            beam_width: config.beam_width as usize,
            length_penalty_weight: config.length_penalty_weight,
            sampling_temperature: config.sampling_temperature,
            max_decode_len: config.max_decode_len as usize,
            rng,
        }
    }
}

impl ExecutionContext for BigramInferContext {
    fn kind(&self) -> ContextKind {
        ContextKind::Infer
    }

    fn restore(&mut self, checkpoint: Option<&Checkpoint>) -> TrainingResult<u64> {
        let (model, step) = load_model(checkpoint)?;
        self.model = model;
        Ok(step)
    }

    fn close(&mut self) -> TrainingResult<()> {
        Ok(())
    }
}

impl InferContext for BigramInferContext {
    fn decode(
        &mut self,
        inputs: &[String],
        options: &DecodeOptions,
    ) -> TrainingResult<InferOutput> {
        let responses = options.n_responses.max(1) as usize;
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut total_len = 0;

        for raw in inputs {
            let start = self.model.start_for(&context_of(raw));
            let candidates = if self.sampling_temperature > 0.0 {
                (0..responses)
                    .map(|_| {
                        self.model.sample(
                            start,
                            self.sampling_temperature,
                            self.max_decode_len,
                            &mut self.rng,
                        )
                    })
                    .collect::<TrainingResult<Vec<_>>>()?
            } else if options.use_beam {
                self.model.beam_search(
                    start,
                    self.beam_width,
                    self.length_penalty_weight,
                    self.max_decode_len,
                )
            } else {
                vec![self.model.greedy(start, self.max_decode_len); responses]
            };

            total_len += candidates.first().map_or(0, Vec::len);
            let texts = candidates.iter().map(|c| self.model.render(c)).collect();
            let decoded =
                if options.use_beam { Decoded::Beam(texts) } else { Decoded::Direct(texts) };
            outputs.push(decoded);
        }

        let mean_len = total_len as f64 / inputs.len().max(1) as f64;
        Ok(InferOutput { outputs, summary: Some(Summary::scalar("decode_len", mean_len)) })
    }
}
