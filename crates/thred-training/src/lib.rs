//! thred training
//!
//! Backend-agnostic training orchestration for hierarchical conversation models:
//! - Persisted run state (`RunConfig`) with save/load and resume
//! - Train/eval/infer execution contexts behind traits (`ModelFactory`)
//! - The training loop (`HierarchicalTrainer`): stats, eval cadence,
//!   checkpointing, patience-based early stopping
//! - Sample decoding and final test-set evaluation

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dataset;
pub mod error;
pub mod final_eval;
pub mod layout;
pub mod log;
pub mod progress;
pub mod sample;
pub mod stats;
pub mod summary;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{RunConfig, RunId};
pub use context::{
    ContextKind, DecodeOptions, Decoded, EvalContext, ExecutionContext, InferContext, InferOutput,
    ModelFactory, Session, StepOutcome, StepStats, TrainContext,
};
pub use dataset::{DialogueExample, DialogueSet, load_dialogues};
pub use error::{TrainingError, TrainingResult};
pub use final_eval::{TestReport, run_test};
pub use layout::ModelLayout;
pub use log::RunLog;
pub use progress::{NullProgressSink, ProgressEvent, ProgressSink};
pub use sample::{SampleDecode, sample_decode};
pub use stats::{StatsAccumulator, StatsReport};
pub use summary::{JsonlSummaryWriter, Summary, SummaryWriter};
pub use trainer::{DevVerdict, HierarchicalTrainer, TerminationReason, TrainReport, judge_dev_ppl};
