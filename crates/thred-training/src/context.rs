//! Execution contexts.
//!
//! A model is driven through three independently constructed contexts: one
//! that trains, one that scores, one that decodes. Each owns its own runtime
//! handle. They share nothing but checkpoints: the train context is the only
//! writer, the other two restore whatever was saved last.

use crate::checkpoint::Checkpoint;
use crate::config::RunConfig;
use crate::error::TrainingResult;
use crate::summary::Summary;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Train,
    Eval,
    Infer,
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Train => "train",
            Self::Eval => "eval",
            Self::Infer => "infer",
        };
        f.write_str(name)
    }
}

/// What one optimization step reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepStats {
    /// Mean loss per example in the batch.
    pub loss: f64,
    pub batch_size: u32,
    /// Target tokens scored by the loss.
    pub predict_count: u64,
    /// All tokens consumed, sources included.
    pub word_count: u64,
    pub grad_norm: f64,
    pub learning_rate: f64,
    /// Optimizer step counter after this update.
    pub global_step: u64,
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Advanced(StepStats),
    /// The training iterator ran dry: the epoch is over.
    EpochExhausted,
}

/// Decoder output for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Beam candidates, best first.
    Beam(Vec<String>),
    /// One sequence per requested response.
    Direct(Vec<String>),
}

impl Decoded {
    #[must_use]
    pub fn candidates(&self) -> &[String] {
        match self {
            Self::Beam(c) | Self::Direct(c) => c,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    pub batch_size: u32,
    pub n_responses: u32,
    /// Return beam candidates rather than a direct decode.
    pub use_beam: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferOutput {
    pub outputs: Vec<Decoded>,
    pub summary: Option<Summary>,
}

pub trait ExecutionContext {
    fn kind(&self) -> ContextKind;

    /// Loads `checkpoint`, or initializes fresh weights when there is none.
    /// Returns the global step of the loaded weights.
    fn restore(&mut self, checkpoint: Option<&Checkpoint>) -> TrainingResult<u64>;

    /// Releases the runtime handle.
    fn close(&mut self) -> TrainingResult<()>;
}

pub trait TrainContext: ExecutionContext {
    fn learning_rate(&self) -> f64;

    /// Rewinds the training iterator, skipping the first `skip_count` examples.
    fn reset_iterator(&mut self, skip_count: u64) -> TrainingResult<()>;

    fn step(&mut self) -> TrainingResult<StepOutcome>;

    /// Writes the current weights as `<prefix>-<global_step>.*` and returns
    /// the files written.
    fn save(&mut self, prefix: &Path, global_step: u64) -> TrainingResult<Vec<PathBuf>>;
}

pub trait EvalContext: ExecutionContext {
    /// Full forward pass over `data` without updates.
    fn perplexity(&mut self, data: &Path) -> TrainingResult<f64>;
}

pub trait InferContext: ExecutionContext {
    /// `inputs` are raw tab-separated dialogue lines.
    fn decode(&mut self, inputs: &[String], options: &DecodeOptions) -> TrainingResult<InferOutput>;
}

/// Builds the three execution contexts for one model.
pub trait ModelFactory {
    type Train: TrainContext;
    type Eval: EvalContext;
    type Infer: InferContext;

    /// Runs once before any context is created.
    fn prepare(&self, _config: &RunConfig) -> TrainingResult<()> {
        Ok(())
    }

    fn create_train(&self, config: &RunConfig) -> TrainingResult<Self::Train>;

    fn create_eval(&self, config: &RunConfig) -> TrainingResult<Self::Eval>;

    fn create_infer(&self, config: &RunConfig) -> TrainingResult<Self::Infer>;
}

/// Owns a context and guarantees it is closed exactly once.
///
/// `close` surfaces the error on the normal path; dropping an unclosed
/// session (early return, `?`, panic) closes it and logs any failure.
pub struct Session<C: ExecutionContext> {
    context: C,
    closed: bool,
}

impl<C: ExecutionContext> Session<C> {
    pub fn new(context: C) -> Self {
        debug!(kind = %context.kind(), "Opened session");
        Self { context, closed: false }
    }

    pub fn close(mut self) -> TrainingResult<()> {
        self.closed = true;
        debug!(kind = %self.context.kind(), "Closing session");
        self.context.close()
    }
}

impl<C: ExecutionContext> Deref for Session<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.context
    }
}

impl<C: ExecutionContext> DerefMut for Session<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.context
    }
}

impl<C: ExecutionContext> Drop for Session<C> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.context.close() {
            warn!(kind = %self.context.kind(), error = %e, "Failed to close session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Probe {
        closes: Rc<Cell<u32>>,
    }

    impl ExecutionContext for Probe {
        fn kind(&self) -> ContextKind {
            ContextKind::Eval
        }

        fn restore(&mut self, _checkpoint: Option<&Checkpoint>) -> TrainingResult<u64> {
            Ok(0)
        }

        fn close(&mut self) -> TrainingResult<()> {
            self.closes.set(self.closes.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_explicit_close_runs_once() {
        let closes = Rc::new(Cell::new(0));
        let session = Session::new(Probe { closes: closes.clone() });
        session.close().unwrap();
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn test_drop_closes_unclosed_session() {
        let closes = Rc::new(Cell::new(0));
        {
            let mut session = Session::new(Probe { closes: closes.clone() });
            session.restore(None).unwrap();
        }
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn test_context_kind_display() {
        assert_eq!(ContextKind::Infer.to_string(), "infer");
    }
}
